//! # Connection Lifecycle
//!
//! The reconnect policy of an upstream connection as a plain state machine.
//! The connection driver reports what happened (attempt started, handshake
//! completed, failure or drop) and the machine answers whether to try again
//! and after how long. No I/O or timers live here.
//!
//! Policy: the attempt counter resets to zero on every successful connect.
//! Each failure or drop consumes one attempt. Once `max_attempts` reconnects
//! have failed in a row the source stays `Disconnected` for good.

use std::time::Duration;

use serde::Serialize;

use crate::configs::ReconnectPolicy;

/// Where an upstream connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No live session.
    Disconnected,
    /// Transport upgrade or namespace handshake in progress.
    Connecting,
    /// Namespace handshake accepted; events flow.
    Connected,
}

/// What the driver should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make reconnect attempt number `attempt`.
    Retry {
        /// 1-based reconnect attempt about to be made.
        attempt: u32,
        /// Fixed wait before it.
        delay: Duration,
    },
    /// The cap is reached. No further attempt may be scheduled.
    Exhausted {
        /// Reconnect attempts that were made.
        attempts: u32,
    },
}

/// Point-in-time view of one connection, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// `true` while events can flow.
    pub connected: bool,
    /// Current state.
    pub state: ConnectionState,
    /// Namespace session id while connected.
    pub session_id: Option<String>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// `true` once the reconnect cap has been hit.
    pub exhausted: bool,
}

/// State, attempt counter and session id of one upstream connection.
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    session_id: Option<String>,
    exhausted: bool,
}

impl ConnectionLifecycle {
    /// A fresh, disconnected lifecycle.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            session_id: None,
            exhausted: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Session id of the live namespace session.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// `true` while events can flow.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// `true` once the reconnect cap has been hit.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Snapshot for status queries.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.is_connected(),
            state: self.state,
            session_id: self.session_id.clone(),
            reconnect_attempts: self.attempts,
            exhausted: self.exhausted,
        }
    }

    /// A connect attempt has started.
    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The handshake completed. Resets the attempt counter.
    pub fn on_connected(&mut self, session_id: impl Into<String>) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.session_id = Some(session_id.into());
        self.exhausted = false;
    }

    /// A connect attempt failed or a live session dropped.
    pub fn on_failure(&mut self) -> ReconnectDecision {
        self.state = ConnectionState::Disconnected;
        self.session_id = None;

        if self.attempts < self.policy.max_attempts {
            self.attempts += 1;
            ReconnectDecision::Retry {
                attempt: self.attempts,
                delay: self.policy.delay,
            }
        } else {
            self.exhausted = true;
            ReconnectDecision::Exhausted {
                attempts: self.attempts,
            }
        }
    }

    /// The connection was closed on purpose. Nothing is scheduled.
    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.session_id = None;
    }
}
