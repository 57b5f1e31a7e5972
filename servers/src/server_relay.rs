//! # Relay Server
//!
//! Connects to the upstream Socket.IO API once per configured source and
//! forwards every accepted event to that source's webhooks. A small HTTP
//! control plane exposes health, statistics and the runtime log configuration.

use anyhow::{Context, Result};
use lib_relay::configs::RelaySettings;
use lib_relay::core::SourceRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

mod relay_logic;
use relay_logic::{config, control, logger, reporter};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 1: Configuration and Logging ---
    let config = config::load_config();
    let (log_control, _log_guard) = logger::setup_logging(&config)?;

    let settings = RelaySettings::from_env().context("Invalid relay configuration")?;
    tracing::info!(
        api_url = %settings.upstream.base_url,
        sources = settings.sources.len(),
        global_webhooks = settings.shared_endpoints.len(),
        "Relay configuration loaded"
    );

    // --- Phase 2: Sources ---
    let mut registry = SourceRegistry::new(Arc::new(settings));
    registry.initialize().context("Failed to start the sources")?;
    let registry = Arc::new(registry);

    // --- Phase 3: Control Plane and Reporter ---
    let (shutdown_tx, _) = broadcast::channel(1);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let state = control::AppState::new(Arc::clone(&registry), Arc::new(log_control));
    let server_handle = tokio::spawn(control::serve(listener, state, shutdown_tx.subscribe()));

    let reporter_handle = reporter::interval_from_minutes(config.log_stats_interval)
        .map(|every| tokio::spawn(reporter::run(Arc::clone(&registry), every, shutdown_tx.subscribe())));

    // --- Phase 4: Shutdown ---
    shutdown_signal().await;

    reporter::log_stats(&registry);
    registry.shutdown_all().await;
    let _ = shutdown_tx.send(());

    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Control plane failed: {:#}", e),
        Err(e) => tracing::error!("Control plane task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Ctrl-C received, initiating shutdown.");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                tracing::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
