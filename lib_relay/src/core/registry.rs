//! # Source Registry
//!
//! Owns one (connection, router, stats) triple per source and is the only
//! entry point the surrounding server needs: start everything, stop
//! everything, and answer stats and status queries.
//!
//! When no named source is configured a single catch-all source is built. It
//! listens on the root namespace, has no allow-list and delivers to the shared
//! endpoints only, so named-source filtering does not apply to it.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::configs::RelaySettings;
use crate::core::lifecycle::ConnectionStatus;
use crate::core::router::EventRouter;
use crate::core::source::Source;
use crate::core::stats::{GlobalStats, StatsAggregator, StatsSnapshot};
use crate::ingestors::SourceConnection;
use crate::retrieve::{DeliveryClient, DeliveryError};

struct SourceEntry {
    router: EventRouter,
    stats: Arc<StatsAggregator>,
    connection: SourceConnection,
}

/// Every source of the relay, in configuration order.
pub struct SourceRegistry {
    settings: Arc<RelaySettings>,
    entries: Vec<SourceEntry>,
}

impl SourceRegistry {
    /// An empty registry over immutable `settings`. Call
    /// [`initialize`](Self::initialize) to build and start the sources.
    pub fn new(settings: Arc<RelaySettings>) -> Self {
        Self {
            settings,
            entries: Vec::new(),
        }
    }

    /// The settings the registry was built from.
    pub fn settings(&self) -> &Arc<RelaySettings> {
        &self.settings
    }

    /// # Initialize
    ///
    /// Builds every source's triple and starts its connection. With zero named
    /// sources the catch-all source is built instead. Calling it again is a
    /// no-op. Must be called from within a Tokio runtime.
    pub fn initialize(&mut self) -> Result<(), DeliveryError> {
        if !self.entries.is_empty() {
            warn!(target: "relay::connection", "Registry already initialized");
            return Ok(());
        }

        let client = DeliveryClient::new(self.settings.delivery)?;
        let shared = Arc::clone(&self.settings.shared_endpoints);

        let sources: Vec<Source> = if self.settings.sources.is_empty() {
            warn!(
                target: "relay::connection",
                "No named sources configured, every event goes through the catch-all source"
            );
            vec![Source::catch_all(shared)]
        } else {
            self.settings
                .sources
                .iter()
                .map(|s| Source::named(s, Arc::clone(&shared)))
                .collect()
        };

        for source in sources {
            let source = Arc::new(source);
            let stats = Arc::new(StatsAggregator::new());
            let router = EventRouter::new(
                Arc::clone(&source),
                Arc::clone(&stats),
                client.clone(),
                &self.settings.features,
            );
            let connection = SourceConnection::new(self.settings.upstream.clone(), router.clone());

            let events = if source.allowed_events().is_empty() {
                "all".to_string()
            } else {
                source.allowed_events().len().to_string()
            };
            info!(
                target: "relay::connection",
                source = %source.name(),
                endpoints = source.target_count(),
                events = %events,
                "Source registered"
            );

            connection.connect();
            self.entries.push(SourceEntry {
                router,
                stats,
                connection,
            });
        }

        info!(target: "relay::connection", sources = self.entries.len(), "Registry initialized");
        Ok(())
    }

    /// # Shutdown All
    ///
    /// Disconnects every source concurrently. Once this returns no new
    /// delivery is started; deliveries already in flight are not awaited.
    pub async fn shutdown_all(&self) {
        join_all(self.entries.iter().map(|e| e.connection.disconnect())).await;
        info!(target: "relay::connection", sources = self.entries.len(), "All sources disconnected");
    }

    /// Source names in configuration order.
    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.router.source().name())
    }

    /// Router of `name`, e.g. to inject events without an upstream.
    pub fn router(&self, name: &str) -> Option<&EventRouter> {
        self.entry(name).map(|e| &e.router)
    }

    /// Sum of every source's snapshot, computed now.
    pub fn global_stats(&self) -> GlobalStats {
        let snapshots: Vec<StatsSnapshot> = self.entries.iter().map(|e| e.stats.snapshot()).collect();
        GlobalStats::aggregate(&snapshots)
    }

    /// Snapshot of one source, `None` when the name is unknown.
    pub fn source_stats(&self, name: &str) -> Option<StatsSnapshot> {
        self.entry(name).map(|e| e.stats.snapshot())
    }

    /// Snapshot of every source by name.
    pub fn all_stats(&self) -> BTreeMap<String, StatsSnapshot> {
        self.entries
            .iter()
            .map(|e| (e.router.source().name().to_string(), e.stats.snapshot()))
            .collect()
    }

    /// Zeroes every source's counters.
    pub fn reset_all_stats(&self) {
        for entry in &self.entries {
            entry.stats.reset();
        }
        info!(target: "relay::stats", "Statistics reset");
    }

    /// Whether the upstream session of `name` is up, `None` when the name is
    /// unknown.
    pub fn is_connected(&self, name: &str) -> Option<bool> {
        self.entry(name).map(|e| e.connection.is_connected())
    }

    /// Connection status of every source by name.
    pub fn connection_status(&self) -> BTreeMap<String, ConnectionStatus> {
        self.entries
            .iter()
            .map(|e| (e.connection.source_name().to_string(), e.connection.status()))
            .collect()
    }

    fn entry(&self, name: &str) -> Option<&SourceEntry> {
        self.entries.iter().find(|e| e.router.source().name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lifecycle::ConnectionState;
    use crate::CATCH_ALL_SOURCE;

    /// Settings pointing at a port nothing listens on, with reconnects off.
    fn offline_settings(extra: &[(&str, &str)]) -> Arc<RelaySettings> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut pairs = vec![
            ("EVOLUTION_API_URL".to_string(), url),
            ("EVOLUTION_API_KEY".to_string(), "secret".to_string()),
            ("RECONNECT_ATTEMPTS".to_string(), "0".to_string()),
        ];
        pairs.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        Arc::new(RelaySettings::from_pairs(pairs).unwrap())
    }

    #[tokio::test]
    async fn test_named_sources_in_order() {
        let settings = offline_settings(&[
            ("INSTANCE_1_NAME", "shop1"),
            ("INSTANCE_1_WEBHOOKS", "http://127.0.0.1:9/a"),
            ("INSTANCE_2_NAME", "shop2"),
            ("INSTANCE_2_WEBHOOKS", "http://127.0.0.1:9/b"),
        ]);
        let mut registry = SourceRegistry::new(settings);
        registry.initialize().unwrap();

        assert_eq!(registry.source_names().collect::<Vec<_>>(), vec!["shop1", "shop2"]);
        assert!(registry.source_stats("shop1").is_some());
        assert!(registry.source_stats("missing").is_none());
        assert_eq!(registry.global_stats().total_sources, 2);
        assert_eq!(registry.connection_status().len(), 2);

        assert_eq!(registry.is_connected("shop1"), Some(false));
        assert_eq!(registry.is_connected("missing"), None);

        registry.shutdown_all().await;
        assert_eq!(registry.is_connected("shop2"), Some(false));
        for status in registry.connection_status().values() {
            assert_eq!(status.state, ConnectionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_catch_all_when_no_sources() {
        let settings = offline_settings(&[("GLOBAL_WEBHOOKS", "http://127.0.0.1:9/hook")]);
        let mut registry = SourceRegistry::new(settings);
        registry.initialize().unwrap();

        assert_eq!(registry.source_names().collect::<Vec<_>>(), vec![CATCH_ALL_SOURCE]);
        let router = registry.router(CATCH_ALL_SOURCE).unwrap();
        assert!(router.source().accepts("anything"));
        assert_eq!(router.source().namespace(), "/");

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_reset_all_stats() {
        let settings = offline_settings(&[("GLOBAL_WEBHOOKS", "http://127.0.0.1:9/hook")]);
        let mut registry = SourceRegistry::new(settings);
        registry.initialize().unwrap();
        registry.shutdown_all().await;

        let stats = Arc::clone(&registry.entries[0].stats);
        stats.record_attempt("messages.upsert", true);
        assert_eq!(registry.global_stats().total_events, 1);

        registry.reset_all_stats();
        let global = registry.global_stats();
        assert_eq!(global.total_events, 0);
        assert_eq!(global.successful_forwards, 0);
        assert_eq!(global.success_rate, "0%");
    }

    #[tokio::test]
    async fn test_initialize_twice_is_a_noop() {
        let settings = offline_settings(&[("GLOBAL_WEBHOOKS", "http://127.0.0.1:9/hook")]);
        let mut registry = SourceRegistry::new(settings);
        registry.initialize().unwrap();
        registry.initialize().unwrap();

        assert_eq!(registry.source_names().count(), 1);
        registry.shutdown_all().await;
    }
}
