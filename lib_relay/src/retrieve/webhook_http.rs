//! # Webhook Delivery Client
//!
//! Delivers one encoded envelope to one endpoint. A call is a failure when it
//! times out, cannot connect or answers with a non-2xx status; all three are
//! retried the same way. Attempts are strictly sequential and separated by a
//! fixed delay, so a slow endpoint only holds up its own retry path.
//!
//! Exactly one outcome is recorded in the source's stats per delivery, however
//! many attempts it took.

use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::configs::DeliverySettings;
use crate::core::source::Envelope;
use crate::core::stats::StatsAggregator;
use crate::USER_AGENT;

/// Header carrying the event type.
pub const EVENT_NAME_HEADER: &str = "X-Event-Name";
/// Header carrying the source name.
pub const INSTANCE_NAME_HEADER: &str = "X-Instance-Name";

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The endpoint did not answer within the per-call timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// Connection refused, DNS failure, TLS failure and the like.
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {status_code}: {body}")]
    Status {
        /// The status received.
        status_code: u16,
        /// Start of the response body, for the logs.
        body: String,
    },

    /// The envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// An envelope encoded once and shared by every endpoint it fans out to.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    /// Event type, sent as [`EVENT_NAME_HEADER`].
    pub event_type: String,
    /// Source name, sent as [`INSTANCE_NAME_HEADER`].
    pub instance: String,
    /// JSON body.
    pub body: Bytes,
}

impl OutboundEvent {
    /// Serializes `envelope` into a reusable request body.
    pub fn encode(envelope: &Envelope) -> Result<Self, DeliveryError> {
        let body = serde_json::to_vec(envelope).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        Ok(Self {
            event_type: envelope.event.clone(),
            instance: envelope.instance.clone(),
            body: Bytes::from(body),
        })
    }
}

/// Result of one HTTP call.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    /// Target endpoint.
    pub endpoint: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Latency on success, the failure otherwise.
    pub outcome: Result<Duration, DeliveryError>,
}

/// Final result of delivering one event to one endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// Target endpoint.
    pub endpoint: String,
    /// Event type delivered.
    pub event_type: String,
    /// Attempts made, first one included.
    pub attempts: u32,
    /// Latency of the successful attempt, `None` when every attempt failed.
    pub latency: Option<Duration>,
    /// Failure of the last attempt when the delivery was given up on.
    pub last_error: Option<DeliveryError>,
    /// Wall time from the first attempt to the final outcome, delays included.
    pub elapsed: Duration,
}

impl DeliveryReport {
    /// `true` when some attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.latency.is_some()
    }
}

/// HTTP client for endpoint delivery. Cheap to clone; clones share one
/// connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    settings: DeliverySettings,
}

impl DeliveryClient {
    /// Builds a client with the configured per-call timeout.
    pub fn new(settings: DeliverySettings) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;

        Ok(Self { client, settings })
    }

    /// Delivers `event` to `endpoint`, retrying up to the configured attempt
    /// count with the fixed delay in between, and records the final outcome in
    /// `stats`.
    pub async fn deliver(
        &self,
        endpoint: &str,
        event: &OutboundEvent,
        stats: &StatsAggregator,
    ) -> DeliveryReport {
        let span = info_span!(
            "delivery",
            source = %event.instance,
            event = %event.event_type,
            endpoint = %endpoint
        );

        async move {
            let started = Instant::now();
            let max_attempts = self.settings.max_attempts.max(1);
            let mut attempt = 1;

            loop {
                let result = self.attempt(endpoint, event, attempt).await;

                let error = match result.outcome {
                    Ok(latency) => {
                        stats.record_delivery(true);
                        info!(
                            target: "relay::forwards",
                            attempt,
                            latency_ms = latency.as_millis() as u64,
                            "Event forwarded"
                        );
                        return DeliveryReport {
                            endpoint: endpoint.to_string(),
                            event_type: event.event_type.clone(),
                            attempts: attempt,
                            latency: Some(latency),
                            last_error: None,
                            elapsed: started.elapsed(),
                        };
                    }
                    Err(error) => error,
                };

                if attempt < max_attempts {
                    warn!(
                        target: "relay::retry",
                        attempt,
                        max_attempts,
                        delay_ms = self.settings.retry_delay.as_millis() as u64,
                        error = %error,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_delay).await;
                    attempt += 1;
                    continue;
                }

                stats.record_delivery(false);
                error!(
                    target: "relay::forwards",
                    attempts = attempt,
                    error = %error,
                    "Delivery failed permanently"
                );
                return DeliveryReport {
                    endpoint: endpoint.to_string(),
                    event_type: event.event_type.clone(),
                    attempts: attempt,
                    latency: None,
                    last_error: Some(error),
                    elapsed: started.elapsed(),
                };
            }
        }
        .instrument(span)
        .await
    }

    /// One POST, no retry and no stats.
    pub async fn attempt(&self, endpoint: &str, event: &OutboundEvent, attempt: u32) -> DeliveryAttempt {
        let started = Instant::now();

        let request = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_NAME_HEADER, event.event_type.as_str())
            .header(INSTANCE_NAME_HEADER, event.instance.as_str())
            .body(event.body.clone());

        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Ok(started.elapsed())
                } else {
                    let body = response.text().await.unwrap_or_default();
                    Err(DeliveryError::Status {
                        status_code: status.as_u16(),
                        body: truncate(body, 256),
                    })
                }
            }
            Err(e) if e.is_timeout() => Err(DeliveryError::Timeout {
                timeout_ms: self.settings.timeout.as_millis() as u64,
            }),
            Err(e) => Err(DeliveryError::Network(e.to_string())),
        };

        debug!(
            target: "relay::forwards",
            attempt,
            ok = outcome.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Attempt finished"
        );

        DeliveryAttempt {
            endpoint: endpoint.to_string(),
            attempt,
            outcome,
        }
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}
