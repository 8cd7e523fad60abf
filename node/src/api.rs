//! # HTTP Status Surface
//!
//! A small axum router over the devnet cluster: lifecycle state and the
//! per-node stats map as JSON, plus a transaction submission endpoint for
//! poking the pipeline from the outside.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use weft_protocol::consensus::InmemCore;
use weft_protocol::net::inmem::InmemTransport;
use weft_protocol::proxy::inmem::InmemAppProxy;
use weft_protocol::Node;

/// The concrete node type the devnet runs.
pub type DevNode = Node<InmemCore, InmemTransport, Arc<InmemAppProxy>>;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub nodes: Vec<DevNode>,
    pub proxies: Vec<Arc<InmemAppProxy>>,
}

/// One node's row in the status response.
#[derive(Serialize)]
struct NodeStatus {
    id: u64,
    addr: String,
    state: String,
    committed_blocks: usize,
}

/// Builds the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/stats", get(all_stats))
        .route("/stats/{id}", get(node_stats))
        .route("/submit/{id}", post(submit))
        .with_state(state)
}

/// GET /status — cluster overview.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let nodes: Vec<NodeStatus> = state
        .nodes
        .iter()
        .zip(&state.proxies)
        .map(|(node, proxy)| NodeStatus {
            id: node.id(),
            addr: node.local_addr().to_string(),
            state: node.state().to_string(),
            committed_blocks: proxy.committed_count(),
        })
        .collect();

    Json(serde_json::json!({
        "version": state.version,
        "nodes": nodes,
    }))
}

/// GET /stats — every node's stats map.
async fn all_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats: BTreeMap<String, BTreeMap<String, String>> = state
        .nodes
        .iter()
        .map(|node| (node.id().to_string(), node.get_stats()))
        .collect();
    Json(stats)
}

/// GET /stats/{id} — one node's stats map.
async fn node_stats(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<BTreeMap<String, String>>, StatusCode> {
    state
        .nodes
        .iter()
        .find(|node| node.id() == id)
        .map(|node| Json(node.get_stats()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /submit/{id} — submit a hex-encoded transaction payload through the
/// given node's application proxy.
async fn submit(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    body: String,
) -> Result<StatusCode, (StatusCode, String)> {
    let payload = hex::decode(body.trim())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid hex payload: {e}")))?;

    let proxy = state
        .nodes
        .iter()
        .position(|node| node.id() == id)
        .and_then(|i| state.proxies.get(i))
        .ok_or((StatusCode::NOT_FOUND, format!("no node {id}")))?;

    proxy
        .submit_transaction(payload)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}
