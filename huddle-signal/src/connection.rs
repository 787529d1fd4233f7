//! Per-socket connection state machine.
//!
//! ```text
//! Online ──open──► Connected ──Intro──► InLobby ──group final──► Syncing
//!    │                 │                   │                        │
//!    └─────────────────┴───── close / error / violation / timeout ──┴──► Dead
//! ```
//!
//! [`Connection::handle`] is pure: it takes one [`Event`] and returns the
//! [`Effect`]s the socket task must carry out, so the whole lifecycle is
//! testable without a socket.
//!
//! The idle timer is armed once at construction and is never reset by
//! traffic. Reaching `Syncing` swaps it for the sync timer; reaching `Dead`
//! stops both.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use rand::Rng;

use crate::config::ServerConfig;
use crate::protocol::{
    self, ClientId, Intro, LobbyId, Proposal, ProtocolError, RelayFrame,
};
use crate::sanitize::sanitize_name;

/// Lifecycle of one connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Socket accepted, transport not yet open
    Online,
    /// Waiting for an Intro
    Connected,
    /// Introduced and waiting in a lobby
    InLobby,
    /// Grouped; relaying signaling data
    Syncing,
    /// Closed. Terminal
    Dead,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Connected => "connected",
            Self::InLobby => "in lobby",
            Self::Syncing => "syncing",
            Self::Dead => "dead",
        }
    }

    /// Whether frames may be written to the socket.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Connected | Self::InLobby | Self::Syncing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a connection died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathCause {
    /// The peer closed the socket
    Closed,
    /// The transport failed
    Transport(String),
    /// The peer broke the protocol
    Violation(ProtocolError),
    /// Idle or sync timer expired
    TimedOut,
    /// Fell too far behind and the hub dropped it
    Evicted,
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The transport is open
    Opened,
    /// A binary frame from the peer
    Frame(Bytes),
    /// A text frame from the peer
    Text,
    /// A frame the hub wants written to the peer
    Deliver(Bytes),
    /// The hub finalized a group holding this connection; carries GROUP_FINAL
    Synced(Bytes),
    /// The hub found a violation it can only detect with group knowledge
    Rejected(ProtocolError),
    /// The active timer expired
    TimedOut,
    /// The hub closed this connection's outbox
    Evicted,
    /// The peer closed the socket
    Closed,
    /// The transport failed
    TransportError(String),
}

/// Timer commands for the socket task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Replace the idle deadline with a fresh sync deadline
    StartSync,
    /// No deadline any more
    Stop,
}

/// Outputs of the state machine, in the order they must be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Transition { from: ConnectionState, to: ConnectionState },
    /// Write a frame to the socket
    Send(Bytes),
    /// Enter the lobby registry
    Join { lobby: LobbyId, name: String },
    Propose(Proposal),
    Relay(RelayFrame),
    Timer(Timer),
    /// Close the socket
    Shutdown(DeathCause),
    /// Tell the hub this client is gone
    Depart,
}

/// State machine of one peer.
pub struct Connection {
    id: ClientId,
    config: Arc<ServerConfig>,
    state: ConnectionState,
    name: Option<String>,
    lobby: Option<LobbyId>,
}

impl Connection {
    pub fn new(id: ClientId, config: Arc<ServerConfig>) -> Self {
        Self {
            id,
            config,
            state: ConnectionState::Online,
            name: None,
            lobby: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn lobby(&self) -> Option<LobbyId> {
        self.lobby
    }

    pub fn is_dead(&self) -> bool {
        self.state == ConnectionState::Dead
    }

    /// Feed one event; returns what the socket task must do.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        if self.is_dead() {
            return Vec::new();
        }
        match event {
            Event::Opened => self.opened(),
            Event::Frame(frame) => match self.dispatch(frame) {
                Ok(effects) => effects,
                Err(err) => self.die(DeathCause::Violation(err)),
            },
            Event::Text => self.die(DeathCause::Violation(ProtocolError::TextFrame)),
            Event::Deliver(frame) if self.state.can_send() => vec![Effect::Send(frame)],
            Event::Deliver(_) => Vec::new(),
            Event::Synced(group_final) => self.synced(group_final),
            Event::Rejected(err) => self.die(DeathCause::Violation(err)),
            Event::TimedOut => self.die(DeathCause::TimedOut),
            Event::Evicted => self.die(DeathCause::Evicted),
            Event::Closed => self.die(DeathCause::Closed),
            Event::TransportError(err) => self.die(DeathCause::Transport(err)),
        }
    }

    fn opened(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Online {
            return Vec::new();
        }
        vec![self.transition(ConnectionState::Connected)]
    }

    fn dispatch(&mut self, frame: Bytes) -> Result<Vec<Effect>, ProtocolError> {
        protocol::check_size(frame.len(), self.config.max_packet_size)?;
        match self.state {
            ConnectionState::Connected => self.introduce(Intro::decode(&frame)?),
            ConnectionState::InLobby => Ok(vec![Effect::Propose(Proposal::decode(&frame)?)]),
            ConnectionState::Syncing => Ok(vec![Effect::Relay(RelayFrame::decode(frame)?)]),
            state => Err(ProtocolError::OutOfState(state.name())),
        }
    }

    fn introduce(&mut self, intro: Intro) -> Result<Vec<Effect>, ProtocolError> {
        let mut effects = Vec::with_capacity(3);
        let name = match sanitize_name(&intro.name, self.config.max_name_length) {
            Some(name) => name,
            None => {
                let prefix = self
                    .config
                    .anonymous_prefix
                    .as_deref()
                    .ok_or(ProtocolError::InvalidName)?;
                let name = anonymous_name(prefix);
                effects.push(Effect::Send(protocol::your_name(&name)));
                name
            }
        };

        self.name = Some(name.clone());
        self.lobby = Some(intro.lobby);
        effects.insert(0, self.transition(ConnectionState::InLobby));
        effects.push(Effect::Join { lobby: intro.lobby, name });
        Ok(effects)
    }

    fn synced(&mut self, group_final: Bytes) -> Vec<Effect> {
        if self.state != ConnectionState::InLobby {
            debug!("{} > ignoring group final while {}", self.id, self.state);
            return Vec::new();
        }
        vec![
            self.transition(ConnectionState::Syncing),
            Effect::Timer(Timer::StartSync),
            Effect::Send(group_final),
        ]
    }

    fn die(&mut self, cause: DeathCause) -> Vec<Effect> {
        let introduced = self.state >= ConnectionState::InLobby;
        let mut effects = vec![
            self.transition(ConnectionState::Dead),
            Effect::Timer(Timer::Stop),
            Effect::Shutdown(cause),
        ];
        if introduced {
            effects.push(Effect::Depart);
        }
        effects
    }

    fn transition(&mut self, to: ConnectionState) -> Effect {
        let from = std::mem::replace(&mut self.state, to);
        debug!("{} > changed state {} -> {}", self.id, from, to);
        Effect::Transition { from, to }
    }
}

/// `prefix` followed by four random digits.
fn anonymous_name(prefix: &str) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{prefix}{suffix:04}")
}
