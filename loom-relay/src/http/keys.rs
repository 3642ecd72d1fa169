//! Room key delivery and encryption status endpoints.

use super::error_response;
use crate::error::KeyDeliveryError;
use crate::keys::KeyDeliveryRequest;
use crate::server::Relay;
use crate::storage::SqliteStorage;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// `GET /api/encrypted-persistence`
pub(super) async fn encrypted_persistence_handler(
    Extension(relay): Extension<Arc<Relay>>,
) -> Json<serde_json::Value> {
    let persistence = relay.persistence();
    Json(json!({
        "enabled": persistence.is_encrypted(),
        "storage": relay.storage_enabled(),
        "keysLoaded": persistence.keys_loaded(),
        "roomsAwaitingKey": persistence.rooms_awaiting_key(),
    }))
}

/// `POST /api/rooms/:roomName/key`
pub(super) async fn deliver_key_handler(
    Extension(relay): Extension<Arc<Relay>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(room_name): Path<String>,
    body: Result<Json<KeyDeliveryRequest>, JsonRejection>,
) -> Response {
    if let Err(e) = relay.rate_limits().check_key_delivery(addr.ip()) {
        tracing::warn!("Key delivery rate limited for {}: {}", addr.ip(), e);
        relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        return key_error_response(KeyDeliveryError::RateLimited);
    }

    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return key_error_response(KeyDeliveryError::InvalidRequest(rejection.body_text()));
        }
    };

    let now = SqliteStorage::current_timestamp_ms();
    match relay.keys().deliver(&room_name, &request, now).await {
        Ok(outcome) => {
            relay.metrics().keys_delivered.fetch_add(1, Ordering::Relaxed);
            Json(outcome).into_response()
        }
        Err(e) => {
            tracing::debug!("Key delivery for {} rejected: {}", room_name, e);
            key_error_response(e)
        }
    }
}

fn key_error_response(e: KeyDeliveryError) -> Response {
    let status = match &e {
        KeyDeliveryError::InvalidRequest(_) | KeyDeliveryError::InvalidKey(_) => {
            StatusCode::BAD_REQUEST
        }
        KeyDeliveryError::StaleTimestamp | KeyDeliveryError::InvalidSignature => {
            StatusCode::UNAUTHORIZED
        }
        KeyDeliveryError::IdentityMismatch => StatusCode::FORBIDDEN,
        KeyDeliveryError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
    };
    error_response(status, e.to_string())
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, LimitsConfig};
    use crate::http::test_support::{app, call, get, post_json, test_relay, test_relay_with};
    use crate::storage::SqliteStorage;
    use axum::http::StatusCode;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use ed25519_dalek::SigningKey;
    use loom_crypto::sign_key_delivery;
    use rand::rngs::OsRng;
    use serde_json::{json, Value};

    fn body(signer: &SigningKey, room: &str, key: &[u8; 32], timestamp: i64) -> Value {
        let key_b64 = STANDARD.encode(key);
        json!({
            "key": key_b64,
            "publicKey": STANDARD.encode(signer.verifying_key().to_bytes()),
            "signature": sign_key_delivery(signer, room, &key_b64, timestamp),
            "timestamp": timestamp,
        })
    }

    #[tokio::test]
    async fn valid_delivery_is_accepted() {
        let relay = test_relay().await;
        let signer = SigningKey::generate(&mut OsRng);
        let now = SqliteStorage::current_timestamp_ms();

        let (status, reply) = call(
            app(relay.clone()),
            post_json("/api/rooms/ws-1/key", body(&signer, "ws-1", &[3u8; 32], now)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["success"], true);
        assert_eq!(reply["room"], "ws-1");
        assert_eq!(reply["owner"], true);
        assert!(relay.persistence().has_key("ws-1"));

        let (_, status_body) = call(app(relay), get("/api/encrypted-persistence")).await;
        assert_eq!(status_body["enabled"], true);
        assert_eq!(status_body["keysLoaded"], 1);
    }

    #[tokio::test]
    async fn other_identity_with_different_key_is_forbidden() {
        let relay = test_relay().await;
        let a = SigningKey::generate(&mut OsRng);
        let c = SigningKey::generate(&mut OsRng);
        let now = SqliteStorage::current_timestamp_ms();

        let (status, _) = call(
            app(relay.clone()),
            post_json("/api/rooms/ws-1/key", body(&a, "ws-1", &[3u8; 32], now)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, reply) = call(
            app(relay),
            post_json("/api/rooms/ws-1/key", body(&c, "ws-1", &[4u8; 32], now)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(reply["error"]
            .as_str()
            .unwrap()
            .contains("already registered by a different identity"));
    }

    #[tokio::test]
    async fn bad_signature_and_stale_timestamp_are_unauthorized() {
        let relay = test_relay().await;
        let signer = SigningKey::generate(&mut OsRng);
        let now = SqliteStorage::current_timestamp_ms();

        let wrong_room = body(&signer, "ws-2", &[3u8; 32], now);
        let (status, _) = call(app(relay.clone()), post_json("/api/rooms/ws-1/key", wrong_room)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let stale = body(&signer, "ws-1", &[3u8; 32], now - 10 * 60 * 1000);
        let (status, _) = call(app(relay), post_json("/api/rooms/ws-1/key", stale)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let relay = test_relay().await;
        let (status, reply) = call(
            app(relay),
            post_json("/api/rooms/ws-1/key", json!({"key": "abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(reply["error"].is_string());
    }

    #[tokio::test]
    async fn deliveries_are_rate_limited_per_address() {
        let config = Config {
            limits: LimitsConfig {
                key_deliveries_per_minute: 2,
                ..LimitsConfig::default()
            },
            ..Config::default()
        };
        let relay = test_relay_with(config).await;

        for _ in 0..2 {
            let (status, _) =
                call(app(relay.clone()), post_json("/api/rooms/ws-1/key", json!({}))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        let (status, _) = call(app(relay.clone()), post_json("/api/rooms/ws-1/key", json!({}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            relay
                .metrics()
                .rate_limit_hits
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
