//! Huddle signaling server.
//!
//! Parses the command line into a [`ServerConfig`], initialises
//! `env_logger`, and serves until ctrl-c.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{info, LevelFilter};

use huddle_signal::{ServerConfig, SignalServer, TlsPaths};

#[derive(Parser, Debug)]
#[command(name = "huddle-server")]
#[command(about = "WebRTC signaling lobby over WebSockets")]
struct Args {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Host to bind
    #[arg(short = 'H', long, default_value = "localhost")]
    hostname: String,

    /// Port to bind, 0 picks a free one
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Largest accepted frame, in bytes
    #[arg(long = "max-size", default_value_t = 10 * 1024)]
    max_packet_size: usize,

    /// Longest display name kept, in characters
    #[arg(long = "max-length", default_value_t = 100)]
    max_name_length: usize,

    /// Simultaneous connections, 0 for unlimited
    #[arg(long, default_value_t = 1 << 16)]
    max_connections: usize,

    /// Milliseconds a client may wait without being grouped
    #[arg(long = "idle-timeout", default_value_t = 20 * 60 * 1000)]
    idle_timeout_ms: u64,

    /// Milliseconds a grouped client stays connected
    #[arg(long = "sync-timeout", default_value_t = 30 * 1000)]
    sync_timeout_ms: u64,

    /// Allow empty names, naming those clients with this prefix
    #[arg(long)]
    anonymous_prefix: Option<String>,

    /// WebSocket sub-protocol clients must offer
    #[arg(long)]
    protocol: Option<String>,

    /// PEM private key, enables TLS together with --cert
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// PEM certificate chain
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
}

impl Args {
    fn level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn into_config(self) -> ServerConfig {
        let tls = match (self.key, self.cert) {
            (Some(key), Some(cert)) => Some(TlsPaths { key, cert }),
            _ => None,
        };
        ServerConfig {
            hostname: self.hostname,
            port: self.port,
            max_connections: self.max_connections,
            max_packet_size: self.max_packet_size,
            max_name_length: self.max_name_length,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            sync_timeout: Duration::from_millis(self.sync_timeout_ms),
            anonymous_prefix: self.anonymous_prefix,
            protocol: self.protocol,
            tls,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.level())
        .parse_default_env()
        .init();

    let server = SignalServer::new(args.into_config());
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutting down...");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults_match_server_config() {
        let config = Args::try_parse_from(["huddle-server"]).unwrap().into_config();
        let default = ServerConfig::default();
        assert_eq!(config.hostname, default.hostname);
        assert_eq!(config.port, default.port);
        assert_eq!(config.max_connections, default.max_connections);
        assert_eq!(config.max_packet_size, default.max_packet_size);
        assert_eq!(config.max_name_length, default.max_name_length);
        assert_eq!(config.idle_timeout, default.idle_timeout);
        assert_eq!(config.sync_timeout, default.sync_timeout);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_flags() {
        let args = Args::try_parse_from([
            "huddle-server",
            "-vv",
            "-H",
            "0.0.0.0",
            "--port",
            "8080",
            "--idle-timeout",
            "1500",
            "--anonymous-prefix",
            "guest",
            "--protocol",
            "huddle",
            "--key",
            "key.pem",
            "--cert",
            "cert.pem",
        ])
        .unwrap();
        assert_eq!(args.level(), LevelFilter::Debug);

        let config = args.into_config();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.anonymous_prefix.as_deref(), Some("guest"));
        assert_eq!(config.protocol.as_deref(), Some("huddle"));
        assert_eq!(
            config.tls,
            Some(TlsPaths { key: "key.pem".into(), cert: "cert.pem".into() })
        );
    }

    #[test]
    fn test_key_requires_cert() {
        assert!(Args::try_parse_from(["huddle-server", "--key", "key.pem"]).is_err());
    }
}
