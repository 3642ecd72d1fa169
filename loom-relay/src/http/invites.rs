//! Invite token endpoints.
//!
//! Creating an invite requires the session token handed out in the
//! `welcome` frame of a socket that is still open. Lookup and use are
//! unauthenticated: the invite token itself is the bearer secret.

use super::error_response;
use crate::error::StorageError;
use crate::server::Relay;
use crate::storage::{NewInvite, RelayStorage, SqliteStorage};
use axum::{
    extract::{rejection::JsonRejection, Path},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Longest accepted invite token.
const MAX_TOKEN_LEN: usize = 256;

/// Body of `POST /api/invites`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInviteRequest {
    /// Opaque bearer token chosen by the client.
    pub token: String,
    /// Kind of entity the invite grants access to.
    pub entity_type: String,
    /// Entity the invite grants access to.
    pub entity_id: String,
    /// Permission granted.
    pub permission: String,
    /// Whether the client must also supply a password.
    #[serde(default)]
    pub requires_password: bool,
    /// Lifetime in ms. Capped at the hard invite age ceiling.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Maximum number of uses.
    #[serde(default)]
    pub max_uses: Option<i64>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn storage_failure(e: StorageError) -> Response {
    tracing::error!("Invite storage failure: {}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
}

/// `POST /api/invites`
pub(super) async fn create_invite_handler(
    Extension(relay): Extension<Arc<Relay>>,
    headers: HeaderMap,
    body: Result<Json<CreateInviteRequest>, JsonRejection>,
) -> Response {
    let Some(peer) = bearer_token(&headers).and_then(|t| relay.signaling().session_peer(t)) else {
        return error_response(StatusCode::UNAUTHORIZED, "valid session token required");
    };
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let fields = [&request.token, &request.entity_type, &request.entity_id, &request.permission];
    if fields.iter().any(|f| f.is_empty()) || request.token.len() > MAX_TOKEN_LEN {
        return error_response(StatusCode::BAD_REQUEST, "missing or invalid invite fields");
    }
    if request.expires_in.map_or(false, |ms| ms <= 0) || request.max_uses.map_or(false, |n| n <= 0)
    {
        return error_response(StatusCode::BAD_REQUEST, "expiresIn and maxUses must be positive");
    }

    let now = SqliteStorage::current_timestamp_ms();
    let ceiling_ms = i64::try_from(relay.config().cleanup.invite_max_age_secs)
        .unwrap_or(i64::MAX / 1000)
        .saturating_mul(1000);
    let lifetime = request.expires_in.map_or(ceiling_ms, |ms| ms.min(ceiling_ms));

    let invite = NewInvite {
        token: request.token,
        entity_type: request.entity_type,
        entity_id: request.entity_id,
        permission: request.permission,
        requires_password: request.requires_password,
        created_at: now,
        expires_at: Some(now.saturating_add(lifetime)),
        max_uses: request.max_uses,
    };

    match relay.storage().create_invite(invite).await {
        Ok(invite) => {
            relay.metrics().invites_created.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "Invite created for {} {} by peer {}",
                invite.entity_type,
                invite.entity_id,
                peer
            );
            (StatusCode::CREATED, Json(invite)).into_response()
        }
        Err(StorageError::DuplicateInvite) => {
            error_response(StatusCode::CONFLICT, "invite already exists")
        }
        Err(e) => storage_failure(e),
    }
}

/// `GET /api/invites/:token`
pub(super) async fn get_invite_handler(
    Extension(relay): Extension<Arc<Relay>>,
    Path(token): Path<String>,
) -> Response {
    let now = SqliteStorage::current_timestamp_ms();
    match relay.storage().get_invite(&token, now).await {
        Ok(Some(invite)) => Json(invite).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "invite not found"),
        Err(e) => storage_failure(e),
    }
}

/// `POST /api/invites/:token/use`
pub(super) async fn use_invite_handler(
    Extension(relay): Extension<Arc<Relay>>,
    Path(token): Path<String>,
) -> Response {
    let now = SqliteStorage::current_timestamp_ms();
    match relay.storage().use_invite(&token, now).await {
        Ok(Some(invite)) => Json(invite).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "invite not found"),
        Err(e) => storage_failure(e),
    }
}
