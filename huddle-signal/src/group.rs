//! Group negotiation.
//!
//! A group is identified by its member set. Proposing is an implicit accept;
//! the group finalizes once every member accepted and closes as soon as any
//! member rejects or leaves. Two clients proposing the same set converge on
//! the same [`Group`] because lookups go through the canonical [`GroupKey`].
//!
//! Only pending groups are stored. Deciding a group removes it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use log::{debug, info};

use crate::protocol::{self, ClientId, CorrelationCode, Delivery, Proposal};

/// Canonical identity of a member set: sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey(Box<[ClientId]>);

impl GroupKey {
    pub fn new(ids: impl IntoIterator<Item = ClientId>) -> Self {
        let ids: BTreeSet<ClientId> = ids.into_iter().collect();
        Self(ids.into_iter().collect())
    }

    /// Members, ascending.
    pub fn ids(&self) -> &[ClientId] {
        &self.0
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.0.binary_search(&id).is_ok()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

/// `members` with `subject` moved to the front, the rest ascending.
pub fn subject_first(members: &[ClientId], subject: ClientId) -> Vec<ClientId> {
    let mut ids = Vec::with_capacity(members.len());
    ids.push(subject);
    ids.extend(members.iter().copied().filter(|&id| id != subject));
    ids
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Pending,
    Finalized,
    Closed,
}

/// Result of feeding a vote to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing changed
    Unchanged,
    /// Still waiting; GROUP_REQUEST for the other members
    Pending(Vec<Delivery>),
    /// Everyone accepted; GROUP_FINAL for every member
    Finalized {
        code: CorrelationCode,
        deliveries: Vec<Delivery>,
    },
    /// Someone declined or left; GROUP_REJECT for the other members
    Closed(Vec<Delivery>),
}

/// One negotiation between a fixed set of clients.
#[derive(Debug)]
pub struct Group {
    key: GroupKey,
    acks: BTreeSet<ClientId>,
    state: GroupState,
    code: Option<CorrelationCode>,
}

impl Group {
    pub fn new(key: GroupKey) -> Self {
        Self {
            key,
            acks: BTreeSet::new(),
            state: GroupState::Pending,
            code: None,
        }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn members(&self) -> &[ClientId] {
        self.key.ids()
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn code(&self) -> Option<CorrelationCode> {
        self.code
    }

    pub fn has_accepted(&self, id: ClientId) -> bool {
        self.acks.contains(&id)
    }

    /// Record acceptance by `id`. Finalizes with `code()` once all accepted.
    pub fn ack(&mut self, id: ClientId, code: impl FnOnce() -> CorrelationCode) -> Outcome {
        if self.state != GroupState::Pending || !self.key.contains(id) || !self.acks.insert(id) {
            return Outcome::Unchanged;
        }

        if self.acks.len() == self.members().len() {
            let code = code();
            self.code = Some(code);
            self.state = GroupState::Finalized;
            let deliveries = self
                .members()
                .iter()
                .map(|&member| {
                    Delivery::new(
                        member,
                        protocol::group_final(code, &subject_first(self.members(), member)),
                    )
                })
                .collect();
            return Outcome::Finalized { code, deliveries };
        }

        let frame = protocol::group_request(&subject_first(self.members(), id));
        Outcome::Pending(self.others(id, frame))
    }

    /// Close the group because `id` declined or is gone.
    pub fn reject(&mut self, id: ClientId) -> Outcome {
        if self.state != GroupState::Pending || !self.key.contains(id) {
            return Outcome::Unchanged;
        }
        self.state = GroupState::Closed;
        let frame = protocol::group_reject(&subject_first(self.members(), id));
        Outcome::Closed(self.others(id, frame))
    }

    fn others(&self, id: ClientId, frame: bytes::Bytes) -> Vec<Delivery> {
        self.members()
            .iter()
            .filter(|&&member| member != id)
            .map(|&member| Delivery::new(member, frame.clone()))
            .collect()
    }
}

/// Why a proposal was ignored. Never fatal to the proposer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    #[error("proposal names ids that cannot be grouped: {0:?}")]
    Unresolvable(Vec<ClientId>),
    #[error("proposal names nobody")]
    NoMembers,
    #[error("no pending group {0} to reject")]
    NoSuchGroup(GroupKey),
}

/// All pending groups, keyed by member set.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    pending: HashMap<GroupKey, Group>,
    by_member: HashMap<ClientId, HashSet<GroupKey>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `proposal` from `initiator`.
    ///
    /// `eligible` tells whether an id may be grouped with the initiator
    /// (present in the same lobby and not yet grouped). Decided groups are
    /// removed before returning.
    pub fn resolve(
        &mut self,
        initiator: ClientId,
        proposal: &Proposal,
        eligible: impl Fn(ClientId) -> bool,
        code: impl FnOnce() -> CorrelationCode,
    ) -> Result<Outcome, Conflict> {
        let unresolvable: Vec<ClientId> = proposal
            .ids
            .iter()
            .copied()
            .filter(|&id| id == initiator || !eligible(id))
            .collect();
        if !unresolvable.is_empty() {
            return Err(Conflict::Unresolvable(unresolvable));
        }
        if proposal.ids.is_empty() {
            return Err(Conflict::NoMembers);
        }

        let key = GroupKey::new(proposal.ids.iter().copied().chain([initiator]));
        let outcome = if proposal.approve {
            if !self.pending.contains_key(&key) {
                debug!("{initiator} > created group {key}");
                for &member in key.ids() {
                    self.by_member.entry(member).or_default().insert(key.clone());
                }
            }
            self.pending
                .entry(key.clone())
                .or_insert_with(|| Group::new(key.clone()))
                .ack(initiator, code)
        } else {
            match self.pending.get_mut(&key) {
                Some(group) => group.reject(initiator),
                None => return Err(Conflict::NoSuchGroup(key)),
            }
        };

        if let Outcome::Finalized { code, .. } = &outcome {
            info!("Group {key} finalized with code {code}");
        }
        if matches!(outcome, Outcome::Finalized { .. } | Outcome::Closed(_)) {
            self.remove(&key);
        }
        Ok(outcome)
    }

    /// Close every pending group holding `id`, as if `id` had rejected each.
    ///
    /// Used when `id` dies or is finalized into another group.
    pub fn withdraw(&mut self, id: ClientId) -> Vec<Delivery> {
        let Some(keys) = self.by_member.get(&id).cloned() else {
            return Vec::new();
        };
        let mut deliveries = Vec::new();
        for key in keys {
            if let Some(group) = self.pending.get_mut(&key) {
                if let Outcome::Closed(closed) = group.reject(id) {
                    debug!("{id} > withdrew from group {key}");
                    deliveries.extend(closed);
                }
            }
            self.remove(&key);
        }
        deliveries
    }

    pub fn get(&self, key: &GroupKey) -> Option<&Group> {
        self.pending.get(key)
    }

    /// Pending groups `id` belongs to.
    pub fn groups_of(&self, id: ClientId) -> usize {
        self.by_member.get(&id).map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn remove(&mut self, key: &GroupKey) {
        if self.pending.remove(key).is_none() {
            return;
        }
        for member in key.ids() {
            if let Some(keys) = self.by_member.get_mut(member) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_member.remove(member);
                }
            }
        }
    }
}
