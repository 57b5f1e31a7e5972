//! # Core Relay Module
//!
//! The per-source engine of the relay. Each configured source owns one upstream
//! connection, one event router and one stats aggregator; the registry holds
//! these triples and is the lifecycle entry point for the surrounding server.
//!
//! ## Core Components:
//!
//! - **`source`**: the source model, the inbound event value and the delivery
//!   envelope serialized to every endpoint.
//!
//! - **`stats`**: lock-free counters per source with consistent snapshots and
//!   resets, plus the global aggregation computed on demand.
//!
//! - **`router`**: the allow-list filter and the concurrent fan-out of one
//!   event to every endpoint of its source.
//!
//! - **`lifecycle`**: the bounded reconnect state machine. It holds no I/O so
//!   the policy can be tested on its own.
//!
//! - **`registry`**: builds and owns every source's triple, starts and stops the
//!   connections and answers the stats and status queries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The bounded reconnect state machine.
pub mod lifecycle;
/// Owns every source and answers the aggregate queries.
#[cfg(feature = "ingestors")]
pub mod registry;
/// Allow-list filtering and concurrent fan-out.
pub mod router;
/// Source model, inbound events and the delivery envelope.
pub mod source;
/// Concurrency-safe per-source counters.
pub mod stats;

// --- Public API Re-exports ---
pub use lifecycle::{ConnectionLifecycle, ConnectionState, ConnectionStatus, ReconnectDecision};
#[cfg(feature = "ingestors")]
pub use registry::SourceRegistry;
pub use router::{EventRouter, RouteOutcome};
pub use source::{Envelope, InboundEvent, Source, SourceKind};
pub use stats::{GlobalStats, StatsAggregator, StatsSnapshot};
