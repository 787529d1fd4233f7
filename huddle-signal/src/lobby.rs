//! Lobby registry: who is waiting where.
//!
//! Lobbies exist only while they have members. The registry itself sends
//! nothing; it returns the [`Delivery`]s the hub must route.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use crate::protocol::{self, ClientId, Delivery, LobbyId};

/// Maps lobby ids to their waiting members and their display names.
#[derive(Debug, Default)]
pub struct LobbyRegistry {
    lobbies: HashMap<LobbyId, BTreeMap<ClientId, String>>,
}

impl LobbyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to `lobby`.
    ///
    /// Everyone already waiting learns about the newcomer and the newcomer
    /// receives one CLIENT_JOIN per existing member.
    pub fn join(&mut self, lobby: LobbyId, id: ClientId, name: &str) -> Vec<Delivery> {
        let members = self.lobbies.entry(lobby).or_insert_with(|| {
            info!("Creating lobby {lobby}");
            BTreeMap::new()
        });

        let announcement = protocol::client_join(id, name);
        let mut deliveries = Vec::with_capacity(members.len() * 2);
        for (&other, other_name) in members.iter() {
            deliveries.push(Delivery::new(other, announcement.clone()));
            deliveries.push(Delivery::new(id, protocol::client_join(other, other_name)));
        }

        members.insert(id, name.to_string());
        info!("{id} > joined lobby {lobby} as {name}");
        deliveries
    }

    /// Remove `id` from `lobby`, deleting the lobby once empty.
    ///
    /// Returns whether `id` was a member. The CLIENT_LEAVE broadcast is
    /// separate, see [`LobbyRegistry::announce_leave`].
    pub fn leave(&mut self, lobby: LobbyId, id: ClientId) -> bool {
        let Some(members) = self.lobbies.get_mut(&lobby) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if removed {
            debug!("{id} > left lobby {lobby}");
        }
        if members.is_empty() {
            self.lobbies.remove(&lobby);
            info!("Removing empty lobby {lobby}");
        }
        removed
    }

    /// CLIENT_LEAVE for `id` to everyone currently in `lobby`.
    pub fn announce_leave(&self, lobby: LobbyId, id: ClientId) -> Vec<Delivery> {
        let frame = protocol::client_leave(id);
        self.members(lobby)
            .filter(|&other| other != id)
            .map(|other| Delivery::new(other, frame.clone()))
            .collect()
    }

    pub fn contains(&self, lobby: LobbyId, id: ClientId) -> bool {
        self.lobbies
            .get(&lobby)
            .is_some_and(|members| members.contains_key(&id))
    }

    /// Members of `lobby`, ascending.
    pub fn members(&self, lobby: LobbyId) -> impl Iterator<Item = ClientId> + '_ {
        self.lobbies
            .get(&lobby)
            .into_iter()
            .flat_map(|members| members.keys().copied())
    }

    pub fn member_count(&self, lobby: LobbyId) -> usize {
        self.lobbies.get(&lobby).map_or(0, BTreeMap::len)
    }

    /// Number of non-empty lobbies.
    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }
}
