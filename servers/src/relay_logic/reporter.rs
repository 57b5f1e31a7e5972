use lib_relay::core::SourceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};

/// Upper bound of the report interval. Longer ones would overflow the timer
/// deadline.
const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Report interval of `LOG_STATS_INTERVAL` minutes, `None` when reports are
/// disabled.
pub fn interval_from_minutes(minutes: u64) -> Option<Duration> {
    (minutes > 0).then(|| Duration::from_secs(minutes.saturating_mul(60)).min(MAX_INTERVAL))
}

/// Logs the statistics of every source every `every` until `shutdown` fires.
pub async fn run(registry: Arc<SourceRegistry>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(target: "relay::stats", "Stats reporter stopped");
                break;
            }
            _ = ticker.tick() => log_stats(&registry),
        }
    }
}

/// One report: the global totals, then one line per source.
pub fn log_stats(registry: &SourceRegistry) {
    let global = registry.global_stats();
    tracing::info!(
        target: "relay::stats",
        sources = global.total_sources,
        total = global.total_events,
        successful = global.successful_forwards,
        failed = global.failed_forwards,
        success_rate = %global.success_rate,
        "Global statistics"
    );

    let status = registry.connection_status();
    for (name, stats) in registry.all_stats() {
        let connected = status.get(&name).is_some_and(|s| s.connected);
        tracing::info!(
            target: "relay::stats",
            source = %name,
            connected,
            total = stats.total_events,
            successful = stats.successful_forwards,
            failed = stats.failed_forwards,
            success_rate = %stats.success_rate,
            "Source statistics"
        );
    }
}
