//! Rate limiting for cipherloom-relay.
//!
//! Two limiters protect the relay:
//! - **Per connection**: a [`MessageLimiter`] owned by each WebSocket
//!   connection caps signaling frames per window.
//! - **Per IP**: a keyed limiter caps key-delivery attempts per client
//!   address.
//!
//! The per-connection limiter is a fixed window: at most N frames between
//! window resets. The keyed limiter uses the governor crate, is backed by
//! DashMap and is shrunk periodically by the cleanup task.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Quota admitting `max` cells per `window`, all of them as one burst.
fn window_quota(max: u32, window: Duration) -> Quota {
    let max = NonZeroU32::new(max).unwrap_or(NonZeroU32::MIN);
    let period = window / max.get();
    Quota::with_period(period)
        .map(|q| q.allow_burst(max))
        .unwrap_or_else(|| Quota::per_second(max))
}

/// Per-connection message limiter.
///
/// Admits at most `rate_max_messages` frames per window. Once a window has
/// elapsed, the next frame starts a fresh one.
pub struct MessageLimiter {
    max: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    started: Instant,
    count: u32,
}

impl MessageLimiter {
    /// Create a limiter for `max` messages per `window`.
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Create a limiter from configuration.
    pub fn from_config(config: &LimitsConfig) -> Self {
        Self::new(config.rate_max_messages, config.rate_window())
    }

    /// Count one frame against the current window.
    pub fn check(&self) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }
        if state.count >= self.max {
            return Err(RateLimitError::MessageLimitExceeded);
        }
        state.count += 1;
        Ok(())
    }
}

impl std::fmt::Debug for MessageLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLimiter")
            .field("max", &self.max)
            .field("window", &self.window)
            .finish()
    }
}

/// Shared rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits key-delivery attempts per client IP.
    ///
    /// Configured via `limits.key_deliveries_per_minute`.
    key_delivery_limiter: Arc<KeyedLimiter<IpAddr>>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("key_delivery_limiter", &"KeyedLimiter<IpAddr>")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        let key_quota = window_quota(config.key_deliveries_per_minute, Duration::from_secs(60));
        Self {
            key_delivery_limiter: Arc::new(RateLimiter::keyed(key_quota)),
        }
    }

    /// Check if a key delivery from `ip` is allowed.
    pub fn check_key_delivery(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.key_delivery_limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::KeyDeliveryLimitExceeded)
    }

    /// Get the number of tracked client addresses (for metrics).
    pub fn key_delivery_keys_count(&self) -> usize {
        self.key_delivery_limiter.len()
    }

    /// Evict stale entries from the keyed limiter.
    ///
    /// `retain_recent()` removes entries whose cells have fully recharged.
    /// Call periodically from the cleanup task.
    pub fn shrink(&self) {
        self.key_delivery_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many messages on this connection.
    MessageLimitExceeded,
    /// Too many key deliveries from this address.
    KeyDeliveryLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageLimitExceeded => {
                write!(f, "message rate limit exceeded")
            }
            Self::KeyDeliveryLimitExceeded => {
                write!(f, "key delivery rate limit exceeded")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
