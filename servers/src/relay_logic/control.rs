//! # Control Plane
//!
//! Small HTTP API over the registry: health, stats queries, stats reset,
//! redacted configuration and the runtime log configuration.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lib_relay::core::SourceRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::relay_logic::logger::{LogControl, LogUpdate};

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SourceRegistry>,
    pub log: Arc<LogControl>,
    pub started: Instant,
}

impl AppState {
    pub fn new(registry: Arc<SourceRegistry>, log: Arc<LogControl>) -> Self {
        Self {
            registry,
            log,
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(global_stats_handler))
        .route("/stats/all/detailed", get(all_stats_handler))
        .route("/stats/reset", post(reset_handler))
        .route("/stats/{name}", get(source_stats_handler))
        .route("/config", get(config_handler))
        .route("/instances", get(instances_handler))
        .route("/logs/config", post(log_config_handler))
        .with_state(state)
}

/// Serves the control plane on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    tracing::info!("Control plane listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            tracing::info!("Control plane shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = &state.registry;
    Json(json!({
        "status": "running",
        "uptimeSeconds": state.started.elapsed().as_secs(),
        "sources": registry.connection_status(),
        "globalStats": registry.global_stats(),
    }))
}

async fn global_stats_handler(State(state): State<AppState>) -> Response {
    Json(state.registry.global_stats()).into_response()
}

async fn all_stats_handler(State(state): State<AppState>) -> Response {
    Json(state.registry.all_stats()).into_response()
}

async fn source_stats_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.source_stats(&name) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Unknown source '{}'", name) })),
        )
            .into_response(),
    }
}

async fn reset_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.registry.reset_all_stats();
    Json(json!({ "message": "Statistics reset" }))
}

async fn config_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let settings = state.registry.settings();
    let sources: Vec<_> = settings
        .sources
        .iter()
        .map(|s| {
            let events = if s.events.is_empty() { json!("all") } else { json!(s.events) };
            json!({
                "name": s.name,
                "webhooks": s.endpoints.len(),
                "totalWebhooks": settings.effective_endpoint_count(s),
                "events": events,
            })
        })
        .collect();

    Json(json!({
        "apiUrl": settings.upstream.base_url.as_str(),
        "apiKeyConfigured": !settings.upstream.api_key.is_empty(),
        "sources": sources,
        "globalWebhooks": settings.shared_endpoints.as_ref(),
        "delivery": {
            "retryAttempts": settings.delivery.max_attempts,
            "retryDelayMs": settings.delivery.retry_delay.as_millis() as u64,
            "timeoutMs": settings.delivery.timeout.as_millis() as u64,
        },
        "reconnect": {
            "attempts": settings.upstream.reconnect.max_attempts,
            "delayMs": settings.upstream.reconnect.delay.as_millis() as u64,
            "connectTimeoutMs": settings.upstream.connect_timeout.as_millis() as u64,
        },
        "features": {
            "addInstancePrefix": settings.features.add_source_prefix,
            "instancePrefix": settings.features.source_prefix,
        },
        "logging": state.log.settings(),
    }))
}

async fn instances_handler(State(state): State<AppState>) -> Response {
    Json(state.registry.connection_status()).into_response()
}

async fn log_config_handler(State(state): State<AppState>, Json(update): Json<LogUpdate>) -> Response {
    match state.log.update(&update) {
        Ok(settings) => {
            tracing::info!(level = %settings.level, "Log configuration updated");
            Json(json!({ "message": "Log configuration updated", "config": settings })).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}
