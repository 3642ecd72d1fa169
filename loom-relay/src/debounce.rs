//! Per-key deferred actions.
//!
//! Scheduling an action for a key cancels the action already pending for
//! that key, so at most one timer exists per key. Actions run on their own
//! tokio task once the delay elapses.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Keyed debounce scheduler.
pub struct Debouncer<K: Eq + Hash> {
    pending: Arc<DashMap<K, Pending>>,
    generation: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `action` after `delay`, replacing any action pending for `key`.
    pub fn schedule<F>(&self, key: K, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let task_key = key.clone();

        // Hold the entry lock while spawning so the task cannot remove itself
        // before it is registered.
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                entry.get().handle.abort();
                let handle = tokio::spawn(run_after(pending, task_key, generation, delay, action));
                entry.insert(Pending { generation, handle });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let handle = tokio::spawn(run_after(pending, task_key, generation, delay, action));
                entry.insert(Pending { generation, handle });
            }
        }
    }

    /// Cancel the action pending for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.pending.remove(key) {
            Some((_, pending)) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending action.
    pub fn cancel_all(&self) {
        self.pending.retain(|_, pending| {
            pending.handle.abort();
            false
        });
    }

    /// Whether an action is pending for `key`.
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no action is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<K> Default for Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.handle.abort();
        }
    }
}

async fn run_after<K, F>(
    pending: Arc<DashMap<K, Pending>>,
    key: K,
    generation: u64,
    delay: Duration,
    action: F,
) where
    K: Eq + Hash,
    F: Future<Output = ()>,
{
    tokio::time::sleep(delay).await;
    // Deregister before running: a schedule() from here on starts a fresh
    // timer instead of aborting this write.
    if pending
        .remove_if(&key, |_, p| p.generation == generation)
        .is_none()
    {
        return;
    }
    action.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_action(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_action() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule("room", Duration::from_millis(1000), counter_action(&runs));
        tokio::time::sleep(Duration::from_millis(900)).await;
        debouncer.schedule("room", Duration::from_millis(1000), counter_action(&runs));
        assert_eq!(debouncer.len(), 1);

        tokio::time::sleep(Duration::from_millis(950)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(debouncer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule("a", Duration::from_millis(100), counter_action(&runs));
        debouncer.schedule("b", Duration::from_millis(100), counter_action(&runs));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_action() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule("room", Duration::from_millis(100), counter_action(&runs));
        assert!(debouncer.is_pending(&"room"));
        assert!(debouncer.cancel(&"room"));
        assert!(!debouncer.cancel(&"room"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_every_key() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule("a", Duration::from_millis(100), counter_action(&runs));
        debouncer.schedule("b", Duration::from_millis(100), counter_action(&runs));
        debouncer.cancel_all();
        assert!(debouncer.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
