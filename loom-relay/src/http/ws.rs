//! WebSocket upgrade for signaling sessions.

use crate::server::Relay;
use crate::session::Session;
use axum::{
    extract::ws::WebSocketUpgrade,
    response::{IntoResponse, Response},
    Extension,
};
use std::sync::Arc;

/// Inbound frame size cap for signaling sockets.
#[derive(Debug, Clone, Copy)]
pub(super) struct MaxMessageSize(pub usize);

/// `GET /ws`
pub(super) async fn ws_handler(
    Extension(relay): Extension<Arc<Relay>>,
    Extension(MaxMessageSize(max)): Extension<MaxMessageSize>,
    ws: WebSocketUpgrade,
) -> Response {
    let shutdown = relay.shutdown_signal();
    if *shutdown.borrow() {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            Session::new(relay).run(socket, shutdown).await;
        })
}
