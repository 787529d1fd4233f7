//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Paths to a PEM encoded private key and certificate chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
}

/// Signaling server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind the listener on
    pub hostname: String,
    /// Port to bind; 0 picks a free one
    pub port: u16,
    /// Simultaneous connections allowed (0 = unlimited)
    pub max_connections: usize,
    /// Largest frame a client may send, in bytes
    pub max_packet_size: usize,
    /// Longest display name kept, in characters
    pub max_name_length: usize,
    /// How long a client may stay connected without being grouped
    pub idle_timeout: Duration,
    /// How long a grouped client stays connected to exchange signaling data
    pub sync_timeout: Duration,
    /// Allows empty names; the server then names the client `prefix` + digits
    pub anonymous_prefix: Option<String>,
    /// WebSocket sub-protocol every client must offer
    pub protocol: Option<String>,
    /// Serve over TLS when set
    pub tls: Option<TlsPaths>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 0,
            max_connections: 1 << 16,
            max_packet_size: 10 * 1024,
            max_name_length: 100,
            idle_timeout: Duration::from_secs(20 * 60),
            sync_timeout: Duration::from_secs(30),
            anonymous_prefix: None,
            protocol: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` string handed to the TCP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}
