//! HTTP endpoints: relay info, health, metrics, and security admin views.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::info;

use crate::metrics;
use crate::session::RelayState;

/// Start the HTTP server for the side endpoints.
pub async fn serve_http(
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http listener ready");
    let app = router(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .route("/security/status", get(security_status))
        .route("/security/audit", get(security_audit))
        .with_state(state)
}

/// NIP-11 relay information document with permissive CORS.
async fn relay_info(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let s = &state.settings;
    let doc = json!({
        "name": s.relay_name,
        "description": s.relay_description,
        "supported_nips": [1, 9, 11, 13, 20, 22, 42],
        "software": "nostrum",
        "version": env!("CARGO_PKG_VERSION"),
        "limitation": {
            "max_message_length": s.max_event_bytes,
            "max_subscriptions": s.max_subscriptions,
            "max_filters": s.max_filters,
            "max_limit": s.max_limit,
            "max_subid_length": s.max_subid_length,
            "max_event_tags": s.max_event_tags,
            "max_content_length": s.max_content_length,
            "min_pow_difficulty": s.pow_min_difficulty,
            "auth_required": s.auth_required,
            "payment_required": false,
        },
    });
    (
        [
            (header::CONTENT_TYPE, "application/nostr+json"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        doc.to_string(),
    )
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

/// Readiness probe: the database must answer.
async fn readyz(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    match state.repo.event_rows().await {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database unavailable"),
    }
}

/// Prometheus text exposition.
async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

/// Aggregate security and relay counters for administrators.
async fn security_status(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    let mut status = state.security.lock().await.status();
    status["relay"] = state.manager.lock().await.stats();
    status["rate_buckets"] = json!(state.limiter.lock().await.tracked_buckets());
    Json(status)
}

/// Per-connection violation detail for administrators.
async fn security_audit(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(state.security.lock().await.audit())
}
