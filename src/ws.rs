//! WebSocket listener: upgrades, connection tasks, and teardown.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::limiter::RateDecision;
use crate::metrics;
use crate::session::{RelayState, Session, SessionControl};

/// Outbound frames buffered per connection before it is torn down.
const OUTBOUND_QUEUE: usize = 256;

/// Start the WebSocket server for the relay protocol.
pub async fn serve_ws(
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "websocket listener ready");
    let app = Router::new().route("/", get(handler)).with_state(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Gate the HTTP upgrade, then hand the socket to the connection task.
async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ip = peer.ip();
    if !origin_allowed(&state, &headers) {
        warn!(%ip, "websocket upgrade refused: origin not allowed");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    match state.limiter.lock().await.connection_opened(ip) {
        RateDecision::Allowed => {}
        RateDecision::Blocked(reason) | RateDecision::Limited(reason) => {
            warn!(%ip, %reason, "websocket upgrade refused");
            return (StatusCode::TOO_MANY_REQUESTS, reason).into_response();
        }
    }
    ws.on_upgrade(move |socket| connection(socket, state, ip))
        .into_response()
}

/// Check the Origin header against the configured allow-list.
fn origin_allowed(state: &RelayState, headers: &HeaderMap) -> bool {
    if state.settings.cors_allow_origins.is_empty() {
        return true;
    }
    match headers.get("origin").and_then(|v| v.to_str().ok()) {
        Some(origin) => state
            .settings
            .cors_allow_origins
            .iter()
            .any(|allowed| allowed == origin),
        // non-browser clients send no Origin header
        None => true,
    }
}

/// Run one connection: a writer task draining the outbound channel and a
/// read loop feeding the session.
async fn connection(socket: WebSocket, state: Arc<RelayState>, ip: IpAddr) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    state
        .manager
        .lock()
        .await
        .register_connection(conn_id, ip, tx.clone());
    metrics::ACTIVE_CONNECTIONS.inc();
    info!(conn_id, %ip, "connection open");

    if state.settings.auth_required {
        let challenge = state.auth.lock().await.issue_challenge(conn_id);
        let _ = tx.try_send(serde_json::json!(["AUTH", challenge]).to_string());
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(conn_id, ip, state.clone(), tx);
    while let Some(Ok(msg)) = ws_rx.next().await {
        let control = match msg {
            Message::Text(text) => session.handle_text(&text).await,
            Message::Binary(_) => session.handle_binary().await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => SessionControl::Continue,
        };
        if control == SessionControl::Disconnect {
            break;
        }
    }

    // Teardown releases every resource the connection owns.
    drop(session);
    state.manager.lock().await.unregister_connection(conn_id);
    state.limiter.lock().await.connection_closed(ip);
    state.auth.lock().await.revoke(conn_id);
    state.security.lock().await.connection_closed(conn_id);
    metrics::ACTIVE_CONNECTIONS.dec();
    writer.abort();
    debug!(conn_id, %ip, "connection closed");
}
