//! WebSocket signaling listener.
//!
//! Architecture:
//! ```text
//! TcpListener ── IdPool (capacity gate)
//!      │
//!      ├── [TLS] ── WebSocket upgrade (sub-protocol check)
//!      │                  │
//!      │            connection task ── Connection state machine
//!      │              │        ▲         idle / sync deadline
//!      │          HubEvent  Outbound
//!      │              ▼        │
//!      └──────────────── Hub ──┘
//! ```
//!
//! Each connection task owns its socket and [`Connection`]. Everything
//! shared between peers lives in the [`Hub`](crate::hub::Hub).

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::ServerConfig;
use crate::connection::{Connection, DeathCause, Effect, Event, Timer};
use crate::hub::{self, HubEvent, HubSender, Outbound, OUTBOX_CAPACITY};
use crate::ids::{ClientIdLease, IdPool};
use crate::protocol::ClientId;
use crate::tls;

/// Listener failures. Per-connection failures are only logged.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
    #[error("handshake not finished within the idle timeout")]
    HandshakeTimeout,
    #[error("no private key found in {0}")]
    MissingKey(PathBuf),
    #[error("no certificate found in {0}")]
    MissingCert(PathBuf),
}

/// The signaling server.
pub struct SignalServer {
    config: Arc<ServerConfig>,
    ids: IdPool,
}

impl SignalServer {
    pub fn new(config: ServerConfig) -> Self {
        let ids = IdPool::new(config.max_connections);
        Self { config: Arc::new(config), ids }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connections currently holding an id.
    pub fn connections(&self) -> usize {
        self.ids.in_use()
    }

    /// Bind the configured host and port.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(self.config.bind_addr()).await?)
    }

    /// Serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves or the listener fails.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let tls = self.config.tls.as_ref().map(tls::load_acceptor).transpose()?;
        info!(
            "Signaling server listening on {}{}",
            listener.local_addr()?,
            if tls.is_some() { " (TLS)" } else { "" }
        );

        let (hub, hub_task) = hub::spawn();
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Listener failed: {e}");
                            break Err(e.into());
                        }
                    };
                    let Some(lease) = self.ids.acquire() else {
                        warn!("Rejecting {addr}: {} connections open", self.ids.in_use());
                        continue;
                    };
                    debug!("{} > accepted {addr}", lease.id());
                    tasks.spawn(handle_connection(
                        stream,
                        addr,
                        lease,
                        tls.clone(),
                        self.config.clone(),
                        hub.clone(),
                    ));
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        info!("Signaling server stopping, closing {} connections", tasks.len());
        tasks.shutdown().await;
        drop(hub);
        let _ = hub_task.await;
        info!("Signaling server stopped");
        result
    }
}

/// One socket from accept to DEAD. The lease is released on return.
///
/// The idle timer starts at accept, so TLS and the WebSocket upgrade spend
/// from the same budget as the Intro.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    lease: ClientIdLease,
    tls: Option<TlsAcceptor>,
    config: Arc<ServerConfig>,
    hub: HubSender,
) {
    let id = lease.id();
    let idle_deadline = Instant::now() + config.idle_timeout;
    let result = match tls {
        Some(acceptor) => match timeout_at(idle_deadline, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => run_session(stream, id, idle_deadline, config, hub).await,
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ServerError::HandshakeTimeout),
        },
        None => run_session(stream, id, idle_deadline, config, hub).await,
    };
    match result {
        Ok(()) => debug!("{id} > connection from {addr} finished"),
        Err(ServerError::HandshakeTimeout) => info!("{id} > {addr} stalled before upgrading"),
        Err(e) => error!("{id} > connection from {addr} failed: {e}"),
    }
    drop(lease);
}

async fn run_session<S>(
    stream: S,
    id: ClientId,
    idle_deadline: Instant,
    config: Arc<ServerConfig>,
    hub: HubSender,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let required = config.protocol.clone();
    let upgrade = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        negotiate_protocol(required.as_deref(), request, response)
    });
    let ws = timeout_at(idle_deadline, upgrade)
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;
    let (mut sink, mut socket) = ws.split();

    let (outbox, mut inbox) = mpsc::channel(OUTBOX_CAPACITY);
    let mut outbox = Some(outbox);
    let mut conn = Connection::new(id, config.clone());
    let mut deadline = Some(idle_deadline);
    let mut effects: VecDeque<Effect> = conn.handle(Event::Opened).into();

    loop {
        while let Some(effect) = effects.pop_front() {
            match effect {
                Effect::Transition { .. } => {}
                Effect::Send(frame) => {
                    if let Err(e) = sink.send(Message::Binary(frame)).await {
                        effects.extend(conn.handle(Event::TransportError(e.to_string())));
                    }
                }
                Effect::Join { lobby, name } => {
                    if let Some(outbox) = outbox.take() {
                        let _ = hub.send(HubEvent::Joined { id, lobby, name, outbox });
                    }
                }
                Effect::Propose(proposal) => {
                    debug!("{id} > proposed {} {:?}", if proposal.approve { "accept" } else { "reject" }, proposal.ids);
                    let _ = hub.send(HubEvent::Proposed { id, proposal });
                }
                Effect::Relay(frame) => {
                    let _ = hub.send(HubEvent::Relayed { id, frame });
                }
                Effect::Timer(Timer::StartSync) => deadline = Some(Instant::now() + config.sync_timeout),
                Effect::Timer(Timer::Stop) => deadline = None,
                Effect::Shutdown(cause) => close(&mut sink, id, cause).await,
                Effect::Depart => {
                    let _ = hub.send(HubEvent::Departed { id });
                }
            }
        }
        if conn.is_dead() {
            return Ok(());
        }

        let event = tokio::select! {
            message = socket.next() => match message {
                Some(Ok(Message::Binary(frame))) => Event::Frame(frame),
                Some(Ok(Message::Text(_))) => Event::Text,
                // pongs are queued by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => Event::Closed,
                Some(Err(e)) => Event::TransportError(e.to_string()),
            },
            // the outbox lives in the hub once joined; closed means evicted
            command = inbox.recv(), if outbox.is_none() => match command {
                Some(Outbound::Frame(frame)) => Event::Deliver(frame),
                Some(Outbound::Sync(frame)) => Event::Synced(frame),
                Some(Outbound::Reject(err)) => Event::Rejected(err),
                None => Event::Evicted,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Event::TimedOut,
        };
        effects.extend(conn.handle(event));
    }
}

async fn close<S>(sink: &mut S, id: ClientId, cause: DeathCause)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let frame = match &cause {
        DeathCause::Closed => {
            info!("{id} > disconnected");
            None
        }
        DeathCause::TimedOut => {
            info!("{id} > timed out");
            None
        }
        DeathCause::Evicted => {
            warn!("{id} > evicted, not reading its frames");
            Some(CloseFrame { code: CloseCode::Again, reason: "too far behind".into() })
        }
        DeathCause::Transport(e) => {
            error!("{id} > transport error: {e}");
            return;
        }
        DeathCause::Violation(err) => {
            warn!("{id} > protocol violation: {err}");
            Some(CloseFrame { code: CloseCode::Policy, reason: err.to_string().into() })
        }
    };
    trace!("{id} > closing socket");
    let _ = sink.send(Message::Close(frame)).await;
    let _ = sink.close().await;
}

/// Handshake callback enforcing the configured sub-protocol, if any.
pub fn negotiate_protocol(
    required: Option<&str>,
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let Some(required) = required else {
        return Ok(response);
    };

    let offered = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == required);

    match HeaderValue::from_str(required) {
        Ok(value) if offered => {
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            Ok(response)
        }
        _ => {
            debug!("Refusing handshake without sub-protocol {required}");
            let mut rejection = ErrorResponse::new(Some(format!("sub-protocol {required} required")));
            *rejection.status_mut() = StatusCode::BAD_REQUEST;
            Err(rejection)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(protocols: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("ws://localhost/");
        if let Some(protocols) = protocols {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocols);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_no_required_protocol_accepts_anything() {
        let response = negotiate_protocol(None, &request(Some("chat")), Response::new(())).unwrap();
        assert!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn test_required_protocol_is_echoed() {
        let response =
            negotiate_protocol(Some("huddle"), &request(Some("chat, huddle")), Response::new(())).unwrap();
        assert_eq!(response.headers()[SEC_WEBSOCKET_PROTOCOL], "huddle");
    }

    #[test]
    fn test_missing_protocol_is_refused() {
        let refused = negotiate_protocol(Some("huddle"), &request(None), Response::new(())).unwrap_err();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);

        let refused = negotiate_protocol(Some("huddle"), &request(Some("chat")), Response::new(())).unwrap_err();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::MissingKey(PathBuf::from("key.pem"));
        assert_eq!(err.to_string(), "no private key found in key.pem");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = SignalServer::new(ServerConfig { hostname: "127.0.0.1".into(), ..ServerConfig::default() });
        let listener = server.bind().await.unwrap();
        server.serve(listener, async {}).await.unwrap();
        assert_eq!(server.connections(), 0);
    }
}
