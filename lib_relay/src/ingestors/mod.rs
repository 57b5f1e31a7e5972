//! # Upstream Ingestors Module
//!
//! The "front door" of the relay: everything that reads events from the
//! upstream Socket.IO server lives here.
//!
//! ## Contained Modules:
//! - **`socketio`**: the Engine.IO / Socket.IO packet codec and the event
//!   payload normalization.
//! - **`source_wss`**: the per-source WebSocket client with its reconnect loop,
//!   driven by the lifecycle state machine in `core`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Socket.IO packet codec and payload normalization.
pub mod socketio;
/// Per-source upstream WebSocket client.
pub mod source_wss;

// --- Public API Re-exports ---
pub use socketio::{NormalizeError, Packet, ProtocolError};
pub use source_wss::{ConnectError, SourceConnection};
