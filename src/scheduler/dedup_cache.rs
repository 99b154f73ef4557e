//! Maps a request's properties hash to its most recent completed,
//! successful run. Coalesces at completion time; lookups are
//! read-heavy and TTL-bounded.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{DedupEntry, RunId};

pub struct DedupCache {
    entries: RwLock<HashMap<[u8; 32], DedupEntry>>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns a hit only if the entry exists and is within TTL. Multiple
    /// identical-hash requests racing ahead of the first completion both
    /// see a miss and proceed independently — eventual dedup, not
    /// singleflight.
    pub async fn lookup(&self, hash: &[u8; 32], now: chrono::DateTime<chrono::Utc>) -> Option<DedupEntry> {
        let entries = self.entries.read().await;
        let entry = entries.get(hash)?;
        let age = now.signed_duration_since(entry.completed_ts);
        if age.to_std().map(|age| age <= self.ttl).unwrap_or(false) {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Records a successful completion as a future dedup target. Only
    /// called for `idempotent` requests that completed with `exit_code 0`.
    pub async fn insert(&self, hash: [u8; 32], run_id: RunId, completed_ts: chrono::DateTime<chrono::Utc>) {
        self.entries.write().await.insert(
            hash,
            DedupEntry {
                properties_hash: hash,
                run_id,
                completed_ts,
            },
        );
        debug!(?run_id, "dedup entry recorded");
    }

    /// Drops entries past TTL; called from the lifecycle tick.
    pub async fn prune(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            now.signed_duration_since(entry.completed_ts)
                .to_std()
                .map(|age| age <= self.ttl)
                .unwrap_or(false)
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_within_ttl_miss_past_ttl() {
        let cache = DedupCache::new(Duration::from_secs(60));
        let hash = [1u8; 32];
        let run_id = RunId { request_id: 1, try_number: 1 };
        let completed = chrono::Utc::now() - chrono::Duration::seconds(30);
        cache.insert(hash, run_id, completed).await;

        assert!(cache.lookup(&hash, chrono::Utc::now()).await.is_some());
        let far_future = chrono::Utc::now() + chrono::Duration::seconds(120);
        assert!(cache.lookup(&hash, far_future).await.is_none());
    }

    #[tokio::test]
    async fn prune_removes_only_expired() {
        let cache = DedupCache::new(Duration::from_secs(60));
        let now = chrono::Utc::now();
        cache
            .insert([1u8; 32], RunId { request_id: 1, try_number: 1 }, now - chrono::Duration::seconds(10))
            .await;
        cache
            .insert([2u8; 32], RunId { request_id: 2, try_number: 1 }, now - chrono::Duration::seconds(120))
            .await;

        let pruned = cache.prune(now).await;
        assert_eq!(pruned, 1);
        assert!(cache.lookup(&[1u8; 32], now).await.is_some());
    }
}
