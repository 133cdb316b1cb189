//! Axum gateway accepting inbound tier connections.
//!
//! Server tiers accept paired phones and desktops on `/api/sync`; the cloud
//! tier accepts every tier of an account on `/ws/{cloud_id}`. Upgraded
//! sockets are handed to the platform's websocket acceptor, and
//! authentication happens on the socket itself.

use crate::sync::tier::TierAddress;
use crate::transport::socket::RawSocket;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;

/// Sync traffic travels over websockets, plain requests carry no body.
pub const MAX_BODY_SIZE: usize = 4_096;

#[derive(Clone)]
pub struct GatewayState {
    acceptor: mpsc::UnboundedSender<RawSocket>,
    own: TierAddress,
    cloud_id: Option<Arc<str>>,
}

impl GatewayState {
    pub fn new(acceptor: mpsc::UnboundedSender<RawSocket>, own: TierAddress) -> Self {
        Self {
            acceptor,
            own,
            cloud_id: None,
        }
    }

    /// Restrict `/ws/{cloud_id}` to one account.
    #[must_use]
    pub fn with_cloud_id(mut self, cloud_id: impl Into<Arc<str>>) -> Self {
        self.cloud_id = Some(cloud_id.into());
        self
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/sync", get(handle_sync))
        .route("/ws/{cloud_id}", get(handle_cloud_sync))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
}

/// Bind `host:port` and serve until the task is dropped.
pub async fn run_gateway(host: &str, port: u16, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid gateway address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {addr}"))?;
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: GatewayState) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(address = %state.own, %local, "Gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// GET /health
async fn handle_health(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "address": state.own.to_string(),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /api/sync
async fn handle_sync(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    accept(state, ws)
}

/// GET /ws/{cloud_id}
async fn handle_cloud_sync(
    State(state): State<GatewayState>,
    Path(cloud_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.cloud_id.as_deref().is_some_and(|id| id != cloud_id) {
        tracing::warn!(%cloud_id, "Rejecting connection for another cloud account");
        return (StatusCode::NOT_FOUND, "Unknown cloud id").into_response();
    }
    accept(state, ws)
}

fn accept(state: GatewayState, ws: WebSocketUpgrade) -> Response {
    if state.acceptor.is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Not accepting connections").into_response();
    }
    ws.on_upgrade(move |socket| async move {
        if state.acceptor.send(RawSocket::from_axum(socket)).is_err() {
            tracing::warn!("Inbound websocket dropped, acceptor is gone");
        }
    })
}
