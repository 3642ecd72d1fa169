//! Bounded routing table of known relays.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::messages::RelayInfo;

/// Last-seen gap (ms) beyond which recency outranks uptime.
pub const RECENCY_WINDOW_MS: u64 = 60_000;

/// Known relays keyed by node id.
///
/// Size never exceeds `capacity`: an insert that would overflow evicts the
/// least-recently-seen entries until the table is at 80% of capacity.
#[derive(Debug)]
pub struct RoutingTable {
    entries: HashMap<String, RelayInfo>,
    capacity: usize,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up an entry.
    pub fn get(&self, node_id: &str) -> Option<&RelayInfo> {
        self.entries.get(node_id)
    }

    /// Insert or replace an entry. Returns `true` if the node was new.
    pub fn upsert(&mut self, relay: RelayInfo) -> bool {
        let is_new = self
            .entries
            .insert(relay.node_id.clone(), relay)
            .is_none();
        if self.entries.len() > self.capacity {
            self.evict();
        }
        is_new
    }

    /// Merge an entry learned second-hand; never replaces a fresher one.
    pub fn merge(&mut self, relay: RelayInfo) -> bool {
        match self.entries.get(&relay.node_id) {
            Some(existing) if existing.last_seen >= relay.last_seen => false,
            _ => self.upsert(relay),
        }
    }

    /// Drop an entry.
    pub fn remove(&mut self, node_id: &str) -> Option<RelayInfo> {
        self.entries.remove(node_id)
    }

    fn evict(&mut self) {
        let target = self.capacity * 8 / 10;
        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(u64, String)> = self
            .entries
            .values()
            .map(|r| (r.last_seen, r.node_id.clone()))
            .collect();
        by_age.sort();

        for (_, node_id) in by_age.into_iter().take(excess) {
            self.entries.remove(&node_id);
        }
        tracing::debug!(
            "Routing table evicted {} stale relays ({} remain)",
            excess,
            self.entries.len()
        );
    }

    /// Best `limit` relays.
    ///
    /// An entry seen more than [`RECENCY_WINDOW_MS`] more recently wins;
    /// otherwise the higher self-reported uptime wins.
    pub fn top(&self, limit: usize) -> Vec<RelayInfo> {
        let mut relays: Vec<&RelayInfo> = Vec::with_capacity(self.entries.len());
        // `rank` is not transitive across windows, so std sorts may panic on it.
        for relay in self.entries.values() {
            let pos = relays
                .iter()
                .position(|placed| rank(relay, placed) == Ordering::Less)
                .unwrap_or(relays.len());
            relays.insert(pos, relay);
        }
        relays.into_iter().take(limit).cloned().collect()
    }

    /// All entries, best first.
    pub fn all(&self) -> Vec<RelayInfo> {
        self.top(self.entries.len())
    }
}

fn rank(a: &RelayInfo, b: &RelayInfo) -> Ordering {
    if a.last_seen.abs_diff(b.last_seen) > RECENCY_WINDOW_MS {
        return b.last_seen.cmp(&a.last_seen);
    }
    b.uptime_secs
        .cmp(&a.uptime_secs)
        .then_with(|| b.last_seen.cmp(&a.last_seen))
        .then_with(|| a.node_id.cmp(&b.node_id))
}
