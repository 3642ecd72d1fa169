//! Mesh discovery endpoints.

use crate::server::Relay;
use axum::{
    extract::Query,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Relays returned when `limit` is absent.
pub const DEFAULT_RELAYS_LIMIT: usize = 10;

/// Upper bound on `limit`.
pub const MAX_RELAYS_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub(super) struct RelaysQuery {
    limit: Option<usize>,
}

/// `GET /api/mesh/status`
pub(super) async fn status_handler(Extension(relay): Extension<Arc<Relay>>) -> Response {
    match relay.mesh() {
        Some(mesh) => {
            Json(json!({ "enabled": true, "status": mesh.status().await })).into_response()
        }
        None => Json(json!({ "enabled": false })).into_response(),
    }
}

/// `GET /api/mesh/relays?limit=N`
pub(super) async fn relays_handler(
    Extension(relay): Extension<Arc<Relay>>,
    Query(query): Query<RelaysQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RELAYS_LIMIT)
        .clamp(1, MAX_RELAYS_LIMIT);
    let relays = match relay.mesh() {
        Some(mesh) => mesh.get_top_relays(limit).await,
        None => Vec::new(),
    };
    Json(json!({ "relays": relays })).into_response()
}
