//! # Source Model
//!
//! A [`Source`] is a named event origin: one upstream namespace, its own
//! endpoints, the shared endpoints appended to them, and an optional
//! allow-list of event types. Sources are built once from the settings and
//! never change afterwards.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::configs::SourceSettings;
use crate::CATCH_ALL_SOURCE;

/// Whether a source was declared or stands in for "everything".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Declared in the configuration; connects to its own namespace.
    Named,
    /// Built when no source is declared; listens on the root namespace and
    /// accepts every event.
    CatchAll,
}

/// One event origin and where its events go.
#[derive(Debug, Clone)]
pub struct Source {
    name: String,
    kind: SourceKind,
    endpoints: Vec<String>,
    shared_endpoints: Arc<[String]>,
    allowed_events: HashSet<String>,
}

impl Source {
    /// Builds a named source from its settings and the shared endpoint list.
    pub fn named(settings: &SourceSettings, shared_endpoints: Arc<[String]>) -> Self {
        Self {
            name: settings.name.clone(),
            kind: SourceKind::Named,
            endpoints: settings.endpoints.clone(),
            shared_endpoints,
            allowed_events: settings.events.iter().cloned().collect(),
        }
    }

    /// Builds the catch-all source. It has no own endpoints and no allow-list.
    pub fn catch_all(shared_endpoints: Arc<[String]>) -> Self {
        Self {
            name: CATCH_ALL_SOURCE.to_string(),
            kind: SourceKind::CatchAll,
            endpoints: Vec::new(),
            shared_endpoints,
            allowed_events: HashSet::new(),
        }
    }

    /// The source name, unique within a registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Named or catch-all.
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Upstream namespace: `/<name>` for named sources, `/` for the catch-all.
    pub fn namespace(&self) -> String {
        match self.kind {
            SourceKind::Named => format!("/{}", self.name),
            SourceKind::CatchAll => "/".to_string(),
        }
    }

    /// The allow-list, empty when every event is accepted.
    pub fn allowed_events(&self) -> &HashSet<String> {
        &self.allowed_events
    }

    /// `true` when `event_type` passes the allow-list.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.allowed_events.is_empty() || self.allowed_events.contains(event_type)
    }

    /// Own endpoints followed by shared endpoints. Duplicates are kept, so an
    /// endpoint listed in both receives the event twice.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.endpoints
            .iter()
            .chain(self.shared_endpoints.iter())
            .map(String::as_str)
    }

    /// Number of entries [`targets`](Self::targets) yields.
    pub fn target_count(&self) -> usize {
        self.endpoints.len() + self.shared_endpoints.len()
    }
}

/// One normalized event as read from the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Name of the source whose connection read the event.
    pub source: String,
    /// Event type name, e.g. `messages.upsert`.
    pub event_type: String,
    /// Normalized payload.
    pub payload: Value,
    /// When the relay read the event.
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// An event of `source` received now.
    pub fn new(source: &str, event_type: &str, payload: Value) -> Self {
        Self {
            source: source.to_string(),
            event_type: event_type.to_string(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// The JSON body POSTed to every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Event type name.
    pub event: String,
    /// Name of the source the event came from.
    pub instance: String,
    /// Relay receipt time, RFC 3339 with milliseconds in UTC.
    pub timestamp: String,
    /// The normalized payload.
    pub data: Value,
    /// `<prefix>-<source>` tag, present only when tagging is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Envelope {
    /// Wraps `data` for `source_name`, stamped with `received_at`.
    pub fn new(
        event_type: &str,
        source_name: &str,
        data: Value,
        source_tag: Option<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event: event_type.to_string(),
            instance: source_name.to_string(),
            timestamp: received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
            source: source_tag,
        }
    }
}
