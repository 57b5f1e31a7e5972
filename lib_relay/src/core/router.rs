//! # Event Router
//!
//! One router per source. It counts every event it is handed, drops the ones
//! the allow-list rejects, and fans the rest out to every target endpoint of
//! the source as independent tasks.
//!
//! ## Fan-out model
//!
//! The envelope is encoded once into a reference-counted body and each
//! (event, endpoint) pair gets its own spawned task running the delivery
//! retry loop. `route_event` returns as soon as the tasks are spawned, so a
//! slow or retrying endpoint never holds back the connection's read loop. The
//! only state the tasks share is the source's [`StatsAggregator`].
//!
//! There is no admission control: under endpoint slowness in-flight tasks grow
//! without bound.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::configs::FeatureFlags;
use crate::core::source::{Envelope, InboundEvent, Source};
use crate::core::stats::StatsAggregator;
use crate::retrieve::{DeliveryClient, DeliveryReport, OutboundEvent};

/// What `route_event` did with an event.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Counted but rejected by the allow-list. Nothing was sent.
    Filtered,
    /// One delivery task per target, in target order.
    Dispatched(Vec<JoinHandle<DeliveryReport>>),
    /// The envelope could not be encoded. Every target counted as failed.
    Unencodable,
}

impl RouteOutcome {
    /// Number of deliveries started.
    pub fn dispatched(&self) -> usize {
        match self {
            RouteOutcome::Dispatched(handles) => handles.len(),
            _ => 0,
        }
    }

    /// Waits for every delivery to finish. Empty unless dispatched.
    pub async fn join(self) -> Vec<DeliveryReport> {
        let RouteOutcome::Dispatched(handles) = self else {
            return Vec::new();
        };

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => error!(target: "relay::errors", "Delivery task aborted: {}", e),
            }
        }
        reports
    }
}

/// Filters and fans out the events of one source.
#[derive(Debug, Clone)]
pub struct EventRouter {
    source: Arc<Source>,
    stats: Arc<StatsAggregator>,
    client: DeliveryClient,
    source_tag: Option<String>,
}

impl EventRouter {
    /// Builds the router of `source`, tagging envelopes per `features`.
    pub fn new(
        source: Arc<Source>,
        stats: Arc<StatsAggregator>,
        client: DeliveryClient,
        features: &FeatureFlags,
    ) -> Self {
        let source_tag = features.source_tag(source.name());
        Self {
            source,
            stats,
            client,
            source_tag,
        }
    }

    /// The source this router serves.
    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    /// The stats every delivery of this router records into.
    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    /// Routes an event received now. See [`EventRouter::route`].
    pub fn route_event(&self, event_type: &str, payload: Value) -> RouteOutcome {
        self.route(InboundEvent::new(self.source.name(), event_type, payload))
    }

    /// # Route
    ///
    /// Counts the event, applies the allow-list and spawns one delivery task
    /// per target. The envelope is stamped with the event's receipt time.
    /// Must be called from within a Tokio runtime.
    pub fn route(&self, event: InboundEvent) -> RouteOutcome {
        let source_name = self.source.name();
        let InboundEvent {
            event_type,
            payload,
            received_at,
            ..
        } = event;
        let event_type = event_type.as_str();

        // --- Phase 1: count before filtering ---
        self.stats.record_received(event_type);

        // --- Phase 2: allow-list ---
        if !self.source.accepts(event_type) {
            debug!(
                target: "relay::events",
                source = %source_name,
                event = %event_type,
                "Event filtered"
            );
            return RouteOutcome::Filtered;
        }

        debug!(
            target: "relay::events",
            source = %source_name,
            event = %event_type,
            targets = self.source.target_count(),
            "Event received"
        );
        debug!(
            target: "relay::events::payload",
            source = %source_name,
            event = %event_type,
            payload = %payload,
            "Event payload"
        );

        // --- Phase 3: encode once ---
        let envelope = Envelope::new(event_type, source_name, payload, self.source_tag.clone(), received_at);
        let outbound = match OutboundEvent::encode(&envelope) {
            Ok(outbound) => Arc::new(outbound),
            Err(e) => {
                for _ in 0..self.source.target_count() {
                    self.stats.record_delivery(false);
                }
                error!(target: "relay::errors", source = %source_name, event = %event_type, "{}", e);
                return RouteOutcome::Unencodable;
            }
        };

        // --- Phase 4: fan-out ---
        let handles = self
            .source
            .targets()
            .map(|endpoint| {
                let endpoint = endpoint.to_string();
                let outbound = Arc::clone(&outbound);
                let stats = Arc::clone(&self.stats);
                let client = self.client.clone();
                tokio::spawn(async move { client.deliver(&endpoint, &outbound, &stats).await })
            })
            .collect();

        RouteOutcome::Dispatched(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{DeliverySettings, SourceSettings};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    fn router_for(endpoints: Vec<String>, shared: Vec<String>, events: &[&str]) -> EventRouter {
        let settings = SourceSettings {
            name: "shop1".to_string(),
            endpoints,
            events: events.iter().map(|e| e.to_string()).collect(),
        };
        let source = Arc::new(Source::named(&settings, Arc::from(shared)));
        let client = DeliveryClient::new(DeliverySettings {
            max_attempts: 1,
            retry_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
        })
        .unwrap();
        EventRouter::new(source, Arc::new(StatsAggregator::new()), client, &FeatureFlags::default())
    }

    #[tokio::test]
    async fn test_filtered_event_is_counted_but_not_sent() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let router = router_for(vec![server.uri()], Vec::new(), &["messages.upsert"]);
        let outcome = router.route_event("connection.update", json!({"state": "open"}));

        assert!(matches!(outcome, RouteOutcome::Filtered));
        let snapshot = router.stats().snapshot();
        assert_eq!(snapshot.total_events, 1);
        assert_eq!(snapshot.by_event_type.get("connection.update"), Some(&1));
        assert_eq!(snapshot.successful_forwards + snapshot.failed_forwards, 0);
    }

    #[tokio::test]
    async fn test_empty_allow_list_delivers_everything() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let router = router_for(vec![server.uri()], Vec::new(), &[]);
        router.route_event("messages.upsert", json!({})).join().await;
        router.route_event("presence.update", json!({})).join().await;

        let snapshot = router.stats().snapshot();
        assert_eq!(snapshot.total_events, 2);
        assert_eq!(snapshot.successful_forwards, 2);
    }

    #[tokio::test]
    async fn test_endpoint_in_both_lists_receives_event_twice() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let hook = format!("{}/hook", server.uri());
        let router = router_for(vec![hook.clone()], vec![hook], &[]);
        let outcome = router.route_event("messages.upsert", json!({"id": 1}));
        assert_eq!(outcome.dispatched(), 2);

        let reports = outcome.join().await;
        assert!(reports.iter().all(DeliveryReport::is_success));
        assert_eq!(router.stats().snapshot().successful_forwards, 2);
    }

    #[tokio::test]
    async fn test_source_tag_added_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::body_partial_json(json!({"source": "evo-shop1", "instance": "shop1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let settings = SourceSettings {
            name: "shop1".to_string(),
            endpoints: vec![server.uri()],
            events: Vec::new(),
        };
        let source = Arc::new(Source::named(&settings, Arc::from(Vec::<String>::new())));
        let features = FeatureFlags {
            add_source_prefix: true,
            source_prefix: "evo".to_string(),
        };
        let client = DeliveryClient::new(DeliverySettings::default()).unwrap();
        let router = EventRouter::new(source, Arc::new(StatsAggregator::new()), client, &features);

        router.route_event("messages.upsert", json!({})).join().await;
    }

    #[tokio::test]
    async fn test_envelope_stamped_with_receipt_time() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::body_partial_json(json!({
                "instance": "shop1",
                "timestamp": "2024-05-01T10:00:00.250Z",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let router = router_for(vec![server.uri()], Vec::new(), &[]);
        let mut event = InboundEvent::new("shop1", "messages.upsert", json!({"id": 1}));
        event.received_at = "2024-05-01T10:00:00.250Z".parse().unwrap();

        let reports = router.route(event).join().await;
        assert!(reports[0].is_success());
    }
}
