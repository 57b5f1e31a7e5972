//! # Relay Integration Test Support
//!
//! Shared fixtures for the end-to-end tests under `tests/`: an in-process
//! Socket.IO upstream speaking Engine.IO v4 over a plain WebSocket, and a few
//! settings builders.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_relay::configs::RelaySettings;
use lib_relay::ingestors::{Packet, socketio};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// What the upstream saw of one client upgrade.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Path and query of the upgrade request.
    pub uri: String,
    /// Value of the `apikey` header, if sent.
    pub api_key: Option<String>,
}

/// A namespace CONNECT packet as the upstream received it.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceConnect {
    /// Namespace the client joined.
    pub namespace: String,
    /// Auth object sent with the packet, if any.
    pub auth: Option<Value>,
}

#[derive(Debug, Clone)]
enum Command {
    Frame(String),
    Drop,
}

/// In-process Socket.IO server. Every client gets the Engine.IO open packet,
/// its namespace connect acknowledged, and whatever the test emits afterwards.
pub struct MockUpstream {
    addr: SocketAddr,
    commands: broadcast::Sender<Command>,
    client_frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    connects: Arc<Mutex<Vec<NamespaceConnect>>>,
    sessions: Arc<AtomicUsize>,
}

impl MockUpstream {
    /// Binds 127.0.0.1 on a free port and starts accepting.
    pub async fn start() -> Self {
        Self::start_with_heartbeat(25_000, 20_000).await
    }

    /// Like [`start`](Self::start) with custom heartbeat timings in the open
    /// packet.
    pub async fn start_with_heartbeat(ping_interval_ms: u64, ping_timeout_ms: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock upstream");
        let addr = listener.local_addr().expect("mock upstream address");

        let (commands, _) = broadcast::channel(64);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));

        let accept_commands = commands.clone();
        let accept_handshakes = Arc::clone(&handshakes);
        let accept_connects = Arc::clone(&connects);
        let accept_sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = accept_sessions.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(serve_client(
                    stream,
                    id,
                    (ping_interval_ms, ping_timeout_ms),
                    accept_commands.subscribe(),
                    frames_tx.clone(),
                    Arc::clone(&accept_handshakes),
                    Arc::clone(&accept_connects),
                ));
            }
        });

        Self {
            addr,
            commands,
            client_frames: tokio::sync::Mutex::new(frames_rx),
            handshakes,
            connects,
            sessions,
        }
    }

    /// Base URL to configure as the upstream.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Sessions accepted so far, reconnects included.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Upgrade requests seen so far.
    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Namespace CONNECT packets received so far.
    pub fn connects(&self) -> Vec<NamespaceConnect> {
        self.connects.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sends a raw frame to every connected client.
    pub fn send_raw(&self, frame: impl Into<String>) {
        let _ = self.commands.send(Command::Frame(frame.into()));
    }

    /// Emits an event on `namespace` to every connected client.
    pub fn emit(&self, namespace: &str, name: &str, args: &[Value]) {
        self.send_raw(socketio::encode_event(namespace, name, args));
    }

    /// Closes every open client socket.
    pub fn drop_clients(&self) {
        let _ = self.commands.send(Command::Drop);
    }

    /// Next frame a client sent after its namespace connect, or `None` after
    /// `wait`.
    pub async fn next_client_frame(&self, wait: Duration) -> Option<String> {
        let mut frames = self.client_frames.lock().await;
        tokio::time::timeout(wait, frames.recv()).await.ok().flatten()
    }
}

async fn serve_client(
    stream: TcpStream,
    id: usize,
    (ping_interval_ms, ping_timeout_ms): (u64, u64),
    mut commands: broadcast::Receiver<Command>,
    frames: mpsc::UnboundedSender<String>,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    connects: Arc<Mutex<Vec<NamespaceConnect>>>,
) {
    let record = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let api_key = req
            .headers()
            .get("apikey")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Handshake {
                uri: req.uri().to_string(),
                api_key,
            });
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, record).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    let open = json!({
        "sid": format!("eio-{}", id),
        "upgrades": [],
        "pingInterval": ping_interval_ms,
        "pingTimeout": ping_timeout_ms,
        "maxPayload": 1_000_000,
    });
    if write.send(Message::text(format!("0{}", open))).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Ok(Command::Frame(frame)) => {
                    if write.send(Message::text(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(Command::Drop) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = write.close().await;
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            message = read.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                match socketio::decode(&text) {
                    Ok(Packet::Connect { namespace, data }) => {
                        connects
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(NamespaceConnect {
                                namespace: namespace.clone(),
                                auth: data,
                            });
                        let ack = socketio::encode_connect(&namespace, &json!({ "sid": format!("ns-{}", id) }));
                        if write.send(Message::text(ack)).await.is_err() {
                            return;
                        }
                    }
                    _ => {
                        let _ = frames.send(text);
                    }
                }
            }
        }
    }
}

/// Relay settings over `pairs`, with the upstream API key filled in.
pub fn settings(upstream_url: &str, pairs: &[(&str, &str)]) -> RelaySettings {
    let mut all = vec![
        ("EVOLUTION_API_URL".to_string(), upstream_url.to_string()),
        ("EVOLUTION_API_KEY".to_string(), "test-key".to_string()),
    ];
    all.extend(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    RelaySettings::from_pairs(all).expect("valid test settings")
}

/// An upstream URL nothing listens on.
pub fn unused_upstream_url() -> String {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    let url = format!("http://{}", unused.local_addr().expect("free port address"));
    drop(unused);
    url
}

/// Polls `check` every 20ms until it holds or `wait` runs out.
pub async fn eventually(wait: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
