//! # lib_relay
//!
//! Shared library for the event relay. It keeps one upstream Socket.IO
//! connection per configured source, filters every inbound event against the
//! source's allow-list and fans it out to all of the source's HTTP endpoints,
//! retrying each delivery independently. Live counters are kept per source and
//! aggregated on demand.
//!
//! ## Module map
//!
//! - [`configs`]: immutable [`RelaySettings`](configs::RelaySettings) built from
//!   environment-style key/value pairs.
//! - [`core`]: stats aggregation, event routing, the reconnect state machine and
//!   the source registry.
//! - [`retrieve`]: the HTTP delivery client with bounded fixed-delay retries.
//! - [`ingestors`]: the Socket.IO wire codec and the per-source upstream client.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "core")]
pub mod retrieve;
#[cfg(feature = "ingestors")]
pub mod ingestors;

/// User agent sent with every delivery. Downstream consumers match on it.
pub const USER_AGENT: &str = "Evolution-WebSocket-Forwarder/2.0";

/// Name of the implicit source used when no named sources are configured.
pub const CATCH_ALL_SOURCE: &str = "global";
