//! HTTP/WebSocket surface.
//!
//! Pass-through only: `/health` and `/stats` report state the workers
//! publish, `/ws` fans the broadcast channel out to dashboard clients with
//! drop-oldest semantics for slow consumers.

use crate::detectors::DetectorStatus;
use crate::metrics::MetricsCollector;
use crate::models::WsServerEvent;
use crate::orderbook::BookHealth;
use crate::resilience::CircuitStatus;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthSnapshot {
    pub status: String,
    pub book: Option<BookHealth>,
    pub detectors: Vec<DetectorStatus>,
    pub circuits: Vec<CircuitStatus>,
    pub storage_queue_depth: i64,
    pub updated_at: i64,
}

/// Shared health state: workers write, the API layer reads.
#[derive(Clone, Default)]
pub struct SharedHealth(Arc<RwLock<HealthSnapshot>>);

impl SharedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, snapshot: HealthSnapshot) {
        *self.0.write() = snapshot;
    }

    pub fn update_circuits(&self, circuits: Vec<CircuitStatus>) {
        self.0.write().circuits = circuits;
    }

    pub fn get(&self) -> HealthSnapshot {
        self.0.read().clone()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<MetricsCollector>,
    pub health: SharedHealth,
    pub broadcast_tx: broadcast::Sender<WsServerEvent>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let mut health = state.health.get();
    if health.status.is_empty() {
        health.status = "starting".to_string();
    }
    Json(health)
}

async fn stats_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    Json(serde_json::json!({
        "metrics": snapshot,
        "health": state.health.get(),
        "now": Utc::now().timestamp_millis(),
    }))
}

async fn ws_handler(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.broadcast_tx.subscribe();
    ws.on_upgrade(move |socket| client_loop(socket, rx, state.metrics))
}

/// Push broadcast frames to one client. A lagged receiver drops the oldest
/// frames and keeps going; a dead socket ends the task.
async fn client_loop(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<WsServerEvent>,
    metrics: Arc<MetricsCollector>,
) {
    metrics.ws_clients.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    debug!("dashboard client connected");

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                MetricsCollector::add(&metrics.ws_frames_dropped, n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize ws frame");
                continue;
            }
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            break;
        }
        MetricsCollector::incr(&metrics.ws_frames_sent);
    }

    metrics.ws_clients.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    debug!("dashboard client disconnected");
}
