//! Per-connection WebSocket session.
//!
//! Each accepted socket gets a [`Session`] that registers with the
//! signaling broker, pumps frames in both directions and drives the
//! heartbeat. Whatever ends the loop (close frame, socket error, heartbeat
//! timeout or shutdown), the connection is removed from every room and topic
//! before `run` returns.

use crate::server::Relay;
use axum::extract::ws::{Message, WebSocket};
use loom_types::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Largest inbound frame accepted, derived from the store payload cap.
///
/// Base64 inflates a blob by 4/3; 64 KiB covers the JSON envelope.
pub fn max_message_size(max_store_payload_bytes: usize) -> usize {
    max_store_payload_bytes
        .saturating_mul(4)
        .saturating_div(3)
        .saturating_add(64 * 1024)
}

/// A per-connection session.
pub struct Session {
    relay: Arc<Relay>,
    peer_id: PeerId,
    outbound: tokio::sync::mpsc::Receiver<Arc<str>>,
    ping_interval: Duration,
    timeout: Duration,
}

impl Session {
    /// Register a new connection with the signaling broker.
    pub fn new(relay: Arc<Relay>) -> Self {
        let connection = relay.signaling().connect();
        let heartbeat = &relay.config().heartbeat;
        let (ping_interval, timeout) = (heartbeat.ping_interval(), heartbeat.timeout());
        Self {
            relay,
            peer_id: connection.peer_id,
            outbound: connection.outbound,
            ping_interval,
            timeout,
        }
    }

    /// Peer id assigned to this connection.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Run the session until the socket closes, the heartbeat times out or
    /// `shutdown` flips to `true`.
    pub async fn run(mut self, mut socket: WebSocket, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("New connection {}", self.peer_id);

        let mut heartbeat = tokio::time::interval(self.ping_interval);
        heartbeat.reset();
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.timeout {
                        tracing::warn!("Heartbeat timeout for {}, disconnecting", self.peer_id);
                        break;
                    }
                    if socket.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                frame = self.outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            if socket.send(Message::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = socket.recv() => {
                    let Some(inbound) = inbound else {
                        break;
                    };
                    match inbound {
                        Ok(Message::Text(text)) => {
                            last_seen = Instant::now();
                            self.relay.signaling().handle_text(&self.peer_id, &text).await;
                        }
                        Ok(Message::Binary(_)) => {
                            last_seen = Instant::now();
                            tracing::debug!("Ignoring binary frame from {}", self.peer_id);
                        }
                        Ok(Message::Ping(payload)) => {
                            last_seen = Instant::now();
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Pong(_)) => {
                            last_seen = Instant::now();
                        }
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            tracing::debug!("Socket error for {}: {}", self.peer_id, e);
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.relay.signaling().disconnect(&self.peer_id);
        tracing::info!("Connection {} closed", self.peer_id);
    }
}
