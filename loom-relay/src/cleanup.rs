//! Background cleanup task for invites and idle rate-limiter entries.
//!
//! Two tiers run on their own intervals:
//! - expired sweep: deletes invites past their explicit expiry and evicts
//!   idle per-address key-delivery limiter entries
//! - ceiling sweep: deletes every invite older than the hard age ceiling,
//!   whatever its expiry says

use crate::config::CleanupConfig;
use crate::error::StorageResult;
use crate::limits::RateLimits;
use crate::storage::{RelayStorage, SqliteStorage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Delete invites whose expiry has passed.
pub async fn sweep_expired(storage: &SqliteStorage, now_ms: i64) -> StorageResult<u64> {
    storage.delete_expired_invites(now_ms).await
}

/// Delete invites created more than `max_age_secs` before `now_ms`.
pub async fn sweep_ceiling(
    storage: &SqliteStorage,
    now_ms: i64,
    max_age_secs: u64,
) -> StorageResult<u64> {
    let max_age_ms = i64::try_from(max_age_secs)
        .unwrap_or(i64::MAX / 1000)
        .saturating_mul(1000);
    storage
        .delete_invites_created_before(now_ms.saturating_sub(max_age_ms))
        .await
}

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    storage: Arc<SqliteStorage>,
    rate_limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        tracing::info!(
            "Cleanup task started (expired: {}s, ceiling: {}s, max age: {}s)",
            config.expired_interval_secs,
            config.hard_ceiling_interval_secs,
            config.invite_max_age_secs
        );

        let mut expired_timer = interval(Duration::from_secs(config.expired_interval_secs.max(1)));
        let mut ceiling_timer =
            interval(Duration::from_secs(config.hard_ceiling_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = expired_timer.tick() => {
                    let now = SqliteStorage::current_timestamp_ms();
                    match sweep_expired(&storage, now).await {
                        Ok(deleted) if deleted > 0 => {
                            tracing::info!("Cleanup: deleted {} expired invites", deleted);
                        }
                        Ok(_) => tracing::debug!("Cleanup: no expired invites"),
                        Err(e) => tracing::error!("Cleanup error: {}", e),
                    }
                    rate_limits.shrink();
                }
                _ = ceiling_timer.tick() => {
                    let now = SqliteStorage::current_timestamp_ms();
                    match sweep_ceiling(&storage, now, config.invite_max_age_secs).await {
                        Ok(deleted) if deleted > 0 => {
                            tracing::info!("Cleanup: deleted {} invites past the age ceiling", deleted);
                        }
                        Ok(_) => tracing::debug!("Cleanup: no invites past the age ceiling"),
                        Err(e) => tracing::error!("Cleanup error: {}", e),
                    }
                }
            }
        }
    })
}
