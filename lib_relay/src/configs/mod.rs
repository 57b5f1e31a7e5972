//! # Configuration Module
//!
//! Holds the process-wide, read-only settings of the relay. The settings are
//! built once at startup from environment-style key/value pairs and then shared
//! behind an `Arc` by every component; nothing in the relay mutates them.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Typed relay settings and the key/value loader.
pub mod relay_config;

pub use relay_config::{
    ConfigError, DeliverySettings, FeatureFlags, ReconnectPolicy, RelaySettings, SourceSettings,
    UpstreamSettings,
};
