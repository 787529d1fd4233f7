//! Single owner of every cross-connection structure.
//!
//! Connection tasks never touch the lobby or group registries directly; they
//! send [`HubEvent`]s over one channel and the hub applies them one at a
//! time. Frames for clients go back through each connection's [`Outbox`].
//!
//! ```text
//!  conn task ──HubEvent──┐                 ┌──Outbound──► conn task
//!  conn task ──HubEvent──┼──► Hub ─────────┼──Outbound──► conn task
//!  conn task ──HubEvent──┘  lobbies        └──Outbound──► conn task
//!                           pending groups
//!                           synced sessions
//! ```
//!
//! CLIENT_LEAVE announcements are deferred until every event already queued
//! has been handled, so peers that died at the same moment are pruned first.
//!
//! Outboxes are bounded. A peer that lets [`OUTBOX_CAPACITY`] commands pile
//! up is evicted: the hub drops its outbox, and the connection task sees
//! the closed channel and dies.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::group::{GroupRegistry, Outcome};
use crate::lobby::LobbyRegistry;
use crate::protocol::{
    ClientId, CorrelationCode, Delivery, LobbyId, Proposal, ProtocolError, RelayFrame,
};

/// Commands from the hub to one connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write this frame if the connection may still send
    Frame(Bytes),
    /// Enter the syncing state, then write this GROUP_FINAL
    Sync(Bytes),
    /// Kill the connection for a violation only the hub can see
    Reject(ProtocolError),
}

/// Commands queued for one connection before it is evicted.
pub const OUTBOX_CAPACITY: usize = 256;

pub type Outbox = mpsc::Sender<Outbound>;

/// Sender half connection tasks use to reach the hub.
pub type HubSender = mpsc::UnboundedSender<HubEvent>;

/// Events from connection tasks.
#[derive(Debug)]
pub enum HubEvent {
    /// A connection finished its Intro
    Joined {
        id: ClientId,
        lobby: LobbyId,
        name: String,
        outbox: Outbox,
    },
    /// A lobby member voted on a group
    Proposed { id: ClientId, proposal: Proposal },
    /// A synced member sent signaling data
    Relayed { id: ClientId, frame: RelayFrame },
    /// An introduced connection died
    Departed { id: ClientId },
}

struct Member {
    lobby: LobbyId,
    outbox: Outbox,
    /// Members of the finalized group, once synced.
    session: Option<Arc<[ClientId]>>,
}

/// Lobby registry, pending groups, and relay routing.
pub struct Hub {
    members: HashMap<ClientId, Member>,
    lobbies: LobbyRegistry,
    groups: GroupRegistry,
    /// Leaves to announce once the queue is drained.
    departures: Vec<(LobbyId, ClientId)>,
    next_code: Box<dyn FnMut() -> CorrelationCode + Send>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::with_code_source(rand::random::<CorrelationCode>)
    }

    /// Use `next_code` for correlation codes instead of random ones.
    pub fn with_code_source(next_code: impl FnMut() -> CorrelationCode + Send + 'static) -> Self {
        Self {
            members: HashMap::new(),
            lobbies: LobbyRegistry::new(),
            groups: GroupRegistry::new(),
            departures: Vec::new(),
            next_code: Box::new(next_code),
        }
    }

    /// Process events until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
            while let Ok(event) = events.try_recv() {
                self.handle(event);
            }
            self.flush_departures();
        }
        debug!("Hub stopped, {} members left", self.members.len());
    }

    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Joined { id, lobby, name, outbox } => self.joined(id, lobby, &name, outbox),
            HubEvent::Proposed { id, proposal } => self.proposed(id, &proposal),
            HubEvent::Relayed { id, frame } => self.relayed(id, &frame),
            HubEvent::Departed { id } => self.departed(id),
        }
    }

    /// Send the deferred CLIENT_LEAVE announcements.
    pub fn flush_departures(&mut self) {
        // announcing can evict a stalled peer, which queues another leave
        while !self.departures.is_empty() {
            for (lobby, id) in std::mem::take(&mut self.departures) {
                let deliveries = self.lobbies.announce_leave(lobby, id);
                self.route(deliveries);
            }
        }
    }

    pub fn lobbies(&self) -> &LobbyRegistry {
        &self.lobbies
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    /// Introduced connections still alive, grouped or not.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_synced(&self, id: ClientId) -> bool {
        self.members.get(&id).is_some_and(|m| m.session.is_some())
    }

    fn joined(&mut self, id: ClientId, lobby: LobbyId, name: &str, outbox: Outbox) {
        if self.members.contains_key(&id) {
            warn!("{id} > joined twice, replacing previous registration");
            self.departed(id);
        }
        self.members.insert(id, Member { lobby, outbox, session: None });
        let deliveries = self.lobbies.join(lobby, id, name);
        self.route(deliveries);
    }

    fn proposed(&mut self, id: ClientId, proposal: &Proposal) {
        let Some(member) = self.members.get(&id) else {
            return;
        };
        if member.session.is_some() {
            debug!("{id} > proposal after sync ignored");
            return;
        }

        let lobby = member.lobby;
        let lobbies = &self.lobbies;
        let next_code = &mut self.next_code;
        let resolved = self.groups.resolve(
            id,
            proposal,
            |other| lobbies.contains(lobby, other),
            || next_code(),
        );

        match resolved {
            Ok(Outcome::Unchanged) => debug!("{id} > proposal {:?} changed nothing", proposal.ids),
            Ok(Outcome::Pending(deliveries)) | Ok(Outcome::Closed(deliveries)) => {
                self.route(deliveries)
            }
            Ok(Outcome::Finalized { code, deliveries }) => self.finalize(code, deliveries),
            Err(conflict) => warn!("{id} > ignored proposal: {conflict}"),
        }
    }

    /// Flip every member to syncing and pull them out of the lobby and any
    /// other negotiation.
    fn finalize(&mut self, code: CorrelationCode, deliveries: Vec<Delivery>) {
        let session: Arc<[ClientId]> = deliveries.iter().map(|d| d.to).collect();
        debug!("Syncing {session:?} under code {code}");

        for delivery in deliveries {
            let Some(member) = self.members.get_mut(&delivery.to) else {
                continue;
            };
            member.session = Some(session.clone());
            if self.lobbies.leave(member.lobby, delivery.to) {
                self.departures.push((member.lobby, delivery.to));
            }
            self.offer(delivery.to, Outbound::Sync(delivery.frame));
        }

        for &id in session.iter() {
            let withdrawn = self.groups.withdraw(id);
            self.route(withdrawn);
        }
    }

    /// Syncing clients have no framing that tells an Intro or Proposal
    /// apart from a relay, so whatever they send is routed by its first
    /// two bytes.
    fn relayed(&mut self, id: ClientId, frame: &RelayFrame) {
        let Some(sender) = self.members.get(&id) else {
            return;
        };
        let Some(session) = sender.session.clone() else {
            debug!("{id} > relay before sync ignored");
            return;
        };

        if frame.to == id {
            trace!("{id} > broadcast {} bytes", frame.payload().len());
            let data = frame.readdressed(id);
            for &other in session.iter().filter(|&&other| other != id) {
                self.relay_to(&session, other, data.clone());
            }
        } else if session.contains(&frame.to) {
            trace!("{id} > {} bytes to {}", frame.payload().len(), frame.to);
            self.relay_to(&session, frame.to, frame.readdressed(id));
        } else {
            warn!("{id} > relay to {} outside its group", frame.to);
            self.offer(id, Outbound::Reject(ProtocolError::UnknownRecipient(frame.to)));
        }
    }

    /// Deliver to `to` only if it is still the holder synced in `session`.
    fn relay_to(&mut self, session: &Arc<[ClientId]>, to: ClientId, data: Bytes) {
        let same_session = self
            .members
            .get(&to)
            .and_then(|member| member.session.as_ref())
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if same_session {
            self.offer(to, Outbound::Frame(data));
        } else {
            debug!("{to} > gone, relay dropped");
        }
    }

    /// Queue `command` for `id`, evicting it if its outbox is full.
    fn offer(&mut self, id: ClientId, command: Outbound) {
        let Some(member) = self.members.get(&id) else {
            return;
        };
        match member.outbox.try_send(command) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                warn!("{id} > outbox full, evicting");
                self.departed(id);
            }
        }
    }

    fn departed(&mut self, id: ClientId) {
        let Some(member) = self.members.remove(&id) else {
            return;
        };
        if member.session.is_some() {
            debug!("{id} > left its group");
            return;
        }
        if self.lobbies.leave(member.lobby, id) {
            self.departures.push((member.lobby, id));
        }
        let withdrawn = self.groups.withdraw(id);
        self.route(withdrawn);
    }

    /// Send lobby-phase frames. Synced members no longer receive them.
    fn route(&mut self, deliveries: Vec<Delivery>) {
        for Delivery { to, frame } in deliveries {
            if self.members.get(&to).is_some_and(|m| m.session.is_none()) {
                self.offer(to, Outbound::Frame(frame));
            }
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("members", &self.members.len())
            .field("lobbies", &self.lobbies.len())
            .field("pending_groups", &self.groups.len())
            .finish()
    }
}

/// Spawn a hub on the current runtime and return its sender.
pub fn spawn() -> (HubSender, tokio::task::JoinHandle<()>) {
    let (sender, events) = mpsc::unbounded_channel();
    let handle = tokio::spawn(Hub::new().run(events));
    info!("Hub started");
    (sender, handle)
}
