//! Reverse index from pool to priority-ordered pending requests.
//!
//! Sharded by `pool` so a bot poll only has to scan candidates for its own
//! pool, not every pending request in the system.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::RequestId;

#[derive(Debug, Clone)]
struct PendingEntry {
    request_id: RequestId,
    priority: u8,
    created_ts: chrono::DateTime<chrono::Utc>,
    dimensions: BTreeMap<String, BTreeSet<String>>,
}

impl PendingEntry {
    fn satisfied_by(&self, bot_dims: &BTreeMap<String, BTreeSet<String>>) -> bool {
        self.dimensions.iter().all(|(key, required)| {
            bot_dims
                .get(key)
                .is_some_and(|values| required.is_subset(values))
        })
    }
}

/// `(priority, created_ts, request_id)` ordering: lowest priority,
/// earliest created, lowest id wins ties deterministically.
fn sort_key(entry: &PendingEntry) -> (u8, chrono::DateTime<chrono::Utc>, RequestId) {
    (entry.priority, entry.created_ts, entry.request_id)
}

#[derive(Default)]
pub struct DimensionIndex {
    pools: RwLock<HashMap<String, Vec<PendingEntry>>>,
}

impl DimensionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        pool: &str,
        request_id: RequestId,
        priority: u8,
        created_ts: chrono::DateTime<chrono::Utc>,
        dimensions: BTreeMap<String, BTreeSet<String>>,
    ) {
        let mut pools = self.pools.write().await;
        pools.entry(pool.to_string()).or_default().push(PendingEntry {
            request_id,
            priority,
            created_ts,
            dimensions,
        });
        debug!(pool, request_id, "inserted into dimension index");
    }

    /// Removes a request from its pool shard. Safe to call even if the
    /// request is already gone (lost race, already expired).
    pub async fn remove(&self, pool: &str, request_id: RequestId) -> bool {
        let mut pools = self.pools.write().await;
        let Some(entries) = pools.get_mut(pool) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.request_id != request_id);
        entries.len() != before
    }

    /// Candidate request ids for `bot_dims` in `pool`, priority-ordered.
    /// The caller retries down this list on claim contention.
    pub async fn candidates(
        &self,
        pool: &str,
        bot_dims: &BTreeMap<String, BTreeSet<String>>,
    ) -> Vec<RequestId> {
        let pools = self.pools.read().await;
        let Some(entries) = pools.get(pool) else {
            return Vec::new();
        };
        let mut matches: Vec<&PendingEntry> = entries
            .iter()
            .filter(|e| e.satisfied_by(bot_dims))
            .collect();
        matches.sort_by_key(|e| sort_key(e));
        matches.into_iter().map(|e| e.request_id).collect()
    }

    pub async fn pool_len(&self, pool: &str) -> usize {
        self.pools.read().await.get(pool).map_or(0, Vec::len)
    }
}
