//! # Source WSS Connection
//!
//! Keeps one Socket.IO session open per source and hands every application
//! event to the source's [`EventRouter`].
//!
//! ## Session flow
//!
//! 1. WebSocket upgrade to `<base>/socket.io/?EIO=4&transport=websocket`,
//!    presenting the credential as an `apikey` header and query parameter.
//! 2. Wait for the Engine.IO open packet, then join the source's namespace with
//!    the credential in the auth object.
//! 3. Read loop: answer pings, route events, watch for silence longer than the
//!    server's ping interval plus timeout.
//!
//! Steps 1 and 2 share one connect timeout. Any failure or drop goes through
//! the [`ConnectionLifecycle`] which decides whether and when to reconnect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::configs::UpstreamSettings;
use crate::core::lifecycle::{ConnectionLifecycle, ConnectionStatus, ReconnectDecision};
use crate::core::router::EventRouter;
use crate::ingestors::socketio::{self, OpenInfo, Packet, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Why a session could not be established or ended.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The upstream URL cannot be turned into a WebSocket URL.
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),

    /// The credential cannot be sent as an HTTP header.
    #[error("credential is not a valid header value")]
    InvalidCredential,

    /// Upgrade, read or write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upgrade plus namespace handshake took longer than allowed.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    /// The server sent something the codec rejects during the handshake.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server refused the namespace.
    #[error("namespace rejected: {0}")]
    Rejected(String),

    /// The server closed the socket.
    #[error("connection closed by server")]
    Closed,
}

/// How a live session ended.
enum SessionEnd {
    Cancelled,
    Dropped(String),
}

/// Builds the Engine.IO WebSocket URL below `base`.
pub fn socket_url(base: &Url, api_key: &str) -> Result<Url, ConnectError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectError::InvalidUrl(format!("unsupported scheme '{}'", other))),
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| ConnectError::InvalidUrl(base.to_string()))?;
    url.set_path("/socket.io/");
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket")
        .append_pair("apikey", api_key);
    Ok(url)
}

struct Shared {
    source_name: String,
    namespace: String,
    upstream: UpstreamSettings,
    router: EventRouter,
    lifecycle: Mutex<ConnectionLifecycle>,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, ConnectionLifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// The upstream connection of one source.
pub struct SourceConnection {
    shared: Arc<Shared>,
    task: Mutex<Option<RunningTask>>,
}

impl SourceConnection {
    /// Prepares the connection of `router`'s source. Nothing is opened yet.
    pub fn new(upstream: UpstreamSettings, router: EventRouter) -> Self {
        let source = router.source();
        let shared = Shared {
            source_name: source.name().to_string(),
            namespace: source.namespace(),
            lifecycle: Mutex::new(ConnectionLifecycle::new(upstream.reconnect)),
            upstream,
            router,
        };
        Self {
            shared: Arc::new(shared),
            task: Mutex::new(None),
        }
    }

    /// Name of the source.
    pub fn source_name(&self) -> &str {
        &self.shared.source_name
    }

    /// Starts the background connection task. A no-op while one is running.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        *self.shared.lifecycle() = ConnectionLifecycle::new(self.shared.upstream.reconnect);

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&self.shared), token.clone()));
        *task = Some(RunningTask { token, handle });
    }

    /// Closes the session and stops reconnecting. Safe in any state. Once this
    /// returns no further event of this source reaches the router.
    pub async fn disconnect(&self) {
        let running = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.handle.await {
                error!(target: "relay::errors", source = %self.shared.source_name, "Connection task failed: {}", e);
            }
        }
        self.shared.lifecycle().on_closed();
    }

    /// `true` while the namespace session is up.
    pub fn is_connected(&self) -> bool {
        self.shared.lifecycle().is_connected()
    }

    /// Snapshot for status queries.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.lifecycle().status()
    }
}

/// # Run
///
/// Connect, serve, and reconnect until cancelled or out of attempts.
async fn run(shared: Arc<Shared>, token: CancellationToken) {
    let source = shared.source_name.clone();

    loop {
        shared.lifecycle().on_connecting();
        info!(target: "relay::connection", source = %source, namespace = %shared.namespace, "Connecting");

        match session(&shared, &token).await {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Dropped(reason)) => {
                warn!(target: "relay::connection", source = %source, reason = %reason, "Disconnected");
            }
            Err(e) => {
                error!(target: "relay::errors", source = %source, "Connection failed: {}", e);
            }
        }

        let decision = shared.lifecycle().on_failure();
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(
                    target: "relay::connection",
                    source = %source,
                    attempt,
                    max_attempts = shared.upstream.reconnect.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
            ReconnectDecision::Exhausted { attempts } => {
                error!(
                    target: "relay::connection",
                    source = %source,
                    attempts,
                    "Reconnect attempts exhausted, source stays disconnected"
                );
                return;
            }
        }
    }

    shared.lifecycle().on_closed();
    info!(target: "relay::connection", source = %source, "Connection closed");
}

/// One session from upgrade to drop.
async fn session(shared: &Shared, token: &CancellationToken) -> Result<SessionEnd, ConnectError> {
    let timeout = shared.upstream.connect_timeout;

    // --- Phase 1: upgrade and namespace handshake ---
    let established = tokio::select! {
        _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
        result = tokio::time::timeout(timeout, establish(shared)) => {
            result.map_err(|_| ConnectError::Timeout(timeout))??
        }
    };
    let (mut write, mut read, open, session_id) = established;

    shared.lifecycle().on_connected(session_id.clone());
    info!(
        target: "relay::connection",
        source = %shared.source_name,
        session_id = %session_id,
        "Connected"
    );

    // --- Phase 2: read loop ---
    let window = open.liveness_window();
    let mut deadline = Instant::now() + window;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = write.send(Message::text(socketio::encode_disconnect(&shared.namespace))).await;
                let _ = write.close().await;
                return Ok(SessionEnd::Cancelled);
            }
            _ = sleep_until(deadline) => {
                return Ok(SessionEnd::Dropped(format!("no heartbeat for {:?}", window)));
            }
            frame = next_text(&mut read) => {
                deadline = Instant::now() + window;
                let text = match frame {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(e) => return Ok(SessionEnd::Dropped(e.to_string())),
                };

                match socketio::decode(&text) {
                    Ok(Packet::Ping) => {
                        if let Err(e) = write.send(Message::text(socketio::encode_pong())).await {
                            return Ok(SessionEnd::Dropped(e.to_string()));
                        }
                    }
                    Ok(Packet::Event { namespace, name, args, .. }) if namespace == shared.namespace => {
                        dispatch(shared, &name, args);
                    }
                    Ok(Packet::Disconnect { namespace }) if namespace == shared.namespace => {
                        return Ok(SessionEnd::Dropped("namespace disconnected by server".to_string()));
                    }
                    Ok(Packet::Close) => {
                        return Ok(SessionEnd::Dropped("closed by server".to_string()));
                    }
                    Ok(Packet::Binary { .. }) => {
                        debug!(target: "relay::events", source = %shared.source_name, "Binary packet skipped");
                    }
                    Ok(other) => {
                        debug!(target: "relay::connection", source = %shared.source_name, packet = ?other, "Packet ignored");
                    }
                    Err(e) => {
                        warn!(target: "relay::errors", source = %shared.source_name, "Undecodable packet: {}", e);
                    }
                }
            }
        }
    }
}

/// Upgrade, Engine.IO open, namespace connect.
async fn establish(shared: &Shared) -> Result<(WsWrite, WsRead, OpenInfo, String), ConnectError> {
    let api_key = &shared.upstream.api_key;
    let url = socket_url(&shared.upstream.base_url, api_key)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;
    let header = HeaderValue::from_str(api_key).map_err(|_| ConnectError::InvalidCredential)?;
    request.headers_mut().insert("apikey", header);

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| ConnectError::Transport(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    let open = loop {
        let Some(text) = next_text(&mut read).await? else {
            continue;
        };
        match socketio::decode(&text)? {
            Packet::Open(open) => break open,
            Packet::Close => return Err(ConnectError::Closed),
            _ => {}
        }
    };

    let auth = json!({ "apikey": api_key });
    write
        .send(Message::text(socketio::encode_connect(&shared.namespace, &auth)))
        .await
        .map_err(|e| ConnectError::Transport(e.to_string()))?;

    loop {
        let Some(text) = next_text(&mut read).await? else {
            continue;
        };
        match socketio::decode(&text)? {
            Packet::Connect { namespace, data } if namespace == shared.namespace => {
                let session_id = data
                    .as_ref()
                    .and_then(|d| d.get("sid"))
                    .and_then(Value::as_str)
                    .unwrap_or(open.sid.as_str())
                    .to_string();
                return Ok((write, read, open, session_id));
            }
            Packet::ConnectError { namespace, message } if namespace == shared.namespace => {
                return Err(ConnectError::Rejected(message));
            }
            Packet::Ping => {
                write
                    .send(Message::text(socketio::encode_pong()))
                    .await
                    .map_err(|e| ConnectError::Transport(e.to_string()))?;
            }
            Packet::Close => return Err(ConnectError::Closed),
            _ => {}
        }
    }
}

/// Next text frame; `None` for control and binary frames.
async fn next_text(read: &mut WsRead) -> Result<Option<String>, ConnectError> {
    match read.next().await {
        Some(Ok(Message::Text(text))) => Ok(Some(text.to_string())),
        Some(Ok(Message::Close(_))) | None => Err(ConnectError::Closed),
        Some(Ok(_)) => Ok(None),
        Some(Err(e)) => Err(ConnectError::Transport(e.to_string())),
    }
}

/// Normalizes an event packet and routes it. Failures are logged, never raised.
fn dispatch(shared: &Shared, name: &str, args: Vec<Value>) {
    if socketio::is_control_event(name) {
        debug!(target: "relay::events", source = %shared.source_name, event = %name, "Control event ignored");
        return;
    }

    match socketio::normalize(&shared.source_name, name, args) {
        Ok(event) => {
            let outcome = shared.router.route(event);
            debug!(
                target: "relay::events",
                source = %shared.source_name,
                event = %name,
                deliveries = outcome.dispatched(),
                "Event dispatched"
            );
        }
        Err(e) => {
            warn!(target: "relay::errors", source = %shared.source_name, "Dropping event: {}", e);
        }
    }
}
