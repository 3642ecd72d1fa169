//! HTTP endpoints for cipherloom-relay.
//!
//! Health, metrics and mesh discovery are read-only. Key delivery and the
//! invite API mutate relay state; `/ws` upgrades to a signaling session.

pub mod health;
mod invites;
mod keys;
mod mesh;
mod metrics;
mod ws;

use crate::server::Relay;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use std::sync::Arc;

pub use health::HealthStatus;
pub use invites::CreateInviteRequest;
pub use mesh::{DEFAULT_RELAYS_LIMIT, MAX_RELAYS_LIMIT};

/// Build the HTTP router with all endpoints.
///
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()` so key
/// delivery can rate limit per client address.
pub fn build_router(relay: Arc<Relay>) -> Router {
    let max_message =
        crate::session::max_message_size(relay.config().limits.max_store_payload_bytes);
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api/mesh/status", get(mesh::status_handler))
        .route("/api/mesh/relays", get(mesh::relays_handler))
        .route(
            "/api/encrypted-persistence",
            get(keys::encrypted_persistence_handler),
        )
        .route("/api/rooms/:room_name/key", post(keys::deliver_key_handler))
        .route("/api/invites", post(invites::create_invite_handler))
        .route("/api/invites/:token", get(invites::get_invite_handler))
        .route("/api/invites/:token/use", post(invites::use_invite_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(Extension(ws::MaxMessageSize(max_message)))
        .layer(Extension(relay))
}

/// JSON error body `{"error": message}` with the given status.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteStorage;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use std::net::SocketAddr;
    use tower::util::ServiceExt;

    pub async fn test_relay_with(config: Config) -> Arc<Relay> {
        let storage = SqliteStorage::in_memory().await.unwrap();
        Arc::new(Relay::new(config, storage, None))
    }

    pub async fn test_relay() -> Arc<Relay> {
        test_relay_with(Config::default()).await
    }

    pub fn app(relay: Arc<Relay>) -> Router {
        build_router(relay).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))))
    }

    /// Send one request and return status plus parsed JSON body (or Null).
    pub async fn call(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}
