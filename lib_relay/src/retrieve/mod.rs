//! # Delivery Module
//!
//! Outbound HTTP for the relay. Every forwarded event leaves the process
//! through the client in this module, one POST per (event, endpoint) pair,
//! with a fixed per-call timeout and a bounded, fixed-delay retry.
//!
//! ## Contained Modules:
//!
//! - **`webhook_http`**: the `reqwest` based [`DeliveryClient`], the encoded
//!   [`OutboundEvent`] body shared by all endpoints of one event, and the
//!   per-attempt and per-delivery results used for logging.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Webhook delivery client with bounded fixed-delay retries.
pub mod webhook_http;

pub use webhook_http::{DeliveryAttempt, DeliveryClient, DeliveryError, DeliveryReport, OutboundEvent};
