//! # huddle-signal - WebRTC signaling lobby
//!
//! Browser peers meet in numbered lobbies, agree on groups through an
//! explicit accept/reject handshake, then relay SDP/ICE payloads to each
//! other until they connect directly and hang up.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────┐
//! │ Browser     │ ◄─────────────────► │ connection task │ ─┐
//! │ (per peer)  │     Binary Proto    │ (Connection)    │  │ HubEvent
//! └─────────────┘                     └─────────────────┘  ▼
//!                                                    ┌─────────────┐
//!                                                    │ Hub         │
//!                                                    │ lobbies     │
//!                                                    │ groups      │
//!                                                    └─────────────┘
//! ```
//!
//! A peer goes online → connected → in lobby → syncing, and dies on
//! close, timeout or any protocol violation.
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (little-endian frames)
//! - [`ids`]: Client id allocation and the connection cap
//! - [`sanitize`]: Display name cleanup
//! - [`connection`]: Per-socket state machine
//! - [`lobby`]: Lobby membership and presence broadcast
//! - [`group`]: Multi-party acceptance handshake
//! - [`hub`]: Single owner of lobbies and groups
//! - [`server`]: WebSocket listener
//! - [`config`]: Server configuration
//! - [`tls`]: PEM loading for TLS

pub mod config;
pub mod connection;
pub mod group;
pub mod hub;
pub mod ids;
pub mod lobby;
pub mod protocol;
pub mod sanitize;
pub mod server;
pub mod tls;

// Re-exports for convenience
pub use config::{ServerConfig, TlsPaths};
pub use connection::{Connection, ConnectionState};
pub use group::{Conflict, GroupKey, GroupRegistry};
pub use hub::Hub;
pub use lobby::LobbyRegistry;
pub use protocol::{
    ClientId, CorrelationCode, Intro, LobbyId, Opcode, Proposal, ProtocolError, RelayFrame,
    ServerMessage,
};
pub use server::{ServerError, SignalServer};
