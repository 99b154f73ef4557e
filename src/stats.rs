//! Periodically-refreshed observability snapshot (SPEC_FULL §4.9).
//!
//! Backs `tasks.count`/`bots.count`. Not a report renderer — it holds
//! plain counters, recomputed on the lifecycle tick's cadence and served
//! stale between ticks, the same in-memory-cache-as-soft-optimization
//! pattern the Dimension Index and Dedup Cache use.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::bots::registry::{AvailabilityCounts, BotRegistry};
use crate::model::TaskState;
use crate::scheduler::request_store::RequestStore;
use crate::scheduler::result_store::ResultStore;

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub tasks_by_state: HashMap<TaskState, usize>,
    pub bot_availability: AvailabilityCounts,
    pub total_requests: usize,
    pub refreshed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Default)]
pub struct Stats {
    snapshot: RwLock<StatsSnapshot>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh(
        &self,
        request_store: &RequestStore,
        result_store: &ResultStore,
        bot_registry: &BotRegistry,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let tasks_by_state = result_store.count_by_state().await;
        let bot_availability = bot_registry.counts(now).await;
        let total_requests = request_store.len().await;

        *self.snapshot.write().await = StatsSnapshot {
            tasks_by_state,
            bot_availability,
            total_requests,
            refreshed_at: Some(now),
        };
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        self.snapshot.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn refresh_populates_snapshot() {
        let request_store = RequestStore::new();
        let result_store = ResultStore::new();
        let bot_registry = BotRegistry::new(Duration::from_secs(300));
        let stats = Stats::new();

        stats.refresh(&request_store, &result_store, &bot_registry, chrono::Utc::now()).await;

        let snapshot = stats.snapshot().await;
        assert!(snapshot.refreshed_at.is_some());
        assert_eq!(snapshot.total_requests, 0);
    }
}
