//! Read-only status API
//!
//! - `GET /health`: 200 while running, 503 otherwise
//! - `GET /status`: node and consensus state
//! - `GET /cluster/servers`, `GET /cluster/shards`: the applied cluster configuration
//! - `GET /metrics`: Prometheus text format

use crate::cluster::{ClusterServer, ServerId, ShardId};
use crate::common::METRICS;
use crate::node::{LifecycleState, Node};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
struct ShardView {
    id: ShardId,
    start_time: i64,
    end_time: i64,
    owners: Vec<ServerId>,
    local: bool,
}

pub fn create_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/cluster/servers", get(servers))
        .route("/cluster/shards", get(shards))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

async fn health(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let state = node.state();
    let code = if state == LifecycleState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "state": state })))
}

async fn status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.status())
}

async fn servers(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let servers: Vec<ClusterServer> = node.cluster().snapshot().servers.values().cloned().collect();
    Json(servers)
}

async fn shards(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let local = node.server_id();
    let shards: Vec<ShardView> = node
        .cluster()
        .snapshot()
        .shards
        .values()
        .map(|s| ShardView {
            id: s.id,
            start_time: s.start_time,
            end_time: s.end_time,
            owners: s.owners.clone(),
            local: local.map_or(false, |id| s.is_local(id)),
        })
        .collect();
    Json(shards)
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}
