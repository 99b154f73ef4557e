//! Periodic tick: expiration sweeps, bot-death detection, dedup
//! pruning, stats refresh.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::bots::BotRegistry;
use crate::config::SchedulerConfig;
use crate::scheduler::dedup_cache::DedupCache;
use crate::scheduler::dimension_index::DimensionIndex;
use crate::scheduler::request_store::RequestStore;
use crate::scheduler::result_store::ResultStore;
use crate::stats::Stats;

pub struct LifecycleTimer {
    request_store: Arc<RequestStore>,
    result_store: Arc<ResultStore>,
    dimension_index: Arc<DimensionIndex>,
    dedup_cache: Arc<DedupCache>,
    bot_registry: Arc<BotRegistry>,
    stats: Arc<Stats>,
    config: SchedulerConfig,
}

impl LifecycleTimer {
    pub fn new(
        request_store: Arc<RequestStore>,
        result_store: Arc<ResultStore>,
        dimension_index: Arc<DimensionIndex>,
        dedup_cache: Arc<DedupCache>,
        bot_registry: Arc<BotRegistry>,
        stats: Arc<Stats>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            request_store,
            result_store,
            dimension_index,
            dedup_cache,
            bot_registry,
            stats,
            config,
        }
    }

    /// Runs the sweep once. Exposed separately from [`Self::spawn`] so
    /// tests can drive a single tick deterministically.
    pub async fn tick(&self, now: chrono::DateTime<chrono::Utc>) {
        let expired = self.expire_overdue_pending(now).await;
        let dead = self.detect_bot_death(now).await;
        let pruned = self.dedup_cache.prune(now).await;
        self.stats.refresh(&self.request_store, &self.result_store, &self.bot_registry, now).await;

        if expired > 0 || dead > 0 || pruned > 0 {
            info!(expired, dead, pruned, "lifecycle tick completed");
        }
    }

    async fn expire_overdue_pending(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let expirations: HashMap<_, _> = self
            .request_store
            .all()
            .await
            .into_iter()
            .map(|r| (r.id, r.expiration_at))
            .collect();
        let overdue = self.result_store.pending_past_expiration(now, &expirations).await;

        for request_id in &overdue {
            if let Some(request) = self.request_store.get(*request_id).await {
                if self
                    .result_store
                    .mark_terminal_from_pending(*request_id, crate::model::TaskState::Expired, now)
                    .await
                    .is_ok()
                {
                    self.dimension_index.remove(&request.pool_fingerprint, *request_id).await;
                }
            }
        }
        overdue.len()
    }

    async fn detect_bot_death(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let cutoff = now - chrono::Duration::seconds(self.config.bot_death_timeout_secs as i64);
        let stale = self.result_store.running_stale_since(cutoff).await;

        for request_id in &stale {
            let allow_retry = self
                .request_store
                .get(*request_id)
                .await
                .map(|r| r.allow_retry)
                .unwrap_or(false);

            match self.result_store.reclaim_dead_run(*request_id, allow_retry, now).await {
                Ok(retried) => {
                    if retried {
                        if let Some(request) = self.request_store.get(*request_id).await {
                            self.dimension_index
                                .insert(
                                    &request.pool_fingerprint,
                                    *request_id,
                                    request.priority,
                                    request.created_ts,
                                    request.properties.dimensions.clone(),
                                )
                                .await;
                        }
                    }
                }
                Err(e) => warn!(request_id, error = %e, "failed to reclaim dead run"),
            }
        }
        stale.len()
    }

    /// Spawns the recurring tick on the current tokio runtime.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.lifecycle_tick);
            loop {
                interval.tick().await;
                self.tick(chrono::Utc::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::BotRegistry;
    use crate::model::{ServiceAccount, TaskProperties, TaskState};
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    fn harness() -> (Arc<RequestStore>, Arc<ResultStore>, Arc<DimensionIndex>, LifecycleTimer) {
        let request_store = Arc::new(RequestStore::new());
        let result_store = Arc::new(ResultStore::new());
        let dimension_index = Arc::new(DimensionIndex::new());
        let dedup_cache = Arc::new(DedupCache::new(Duration::from_secs(3600)));
        let bot_registry = Arc::new(BotRegistry::new(Duration::from_secs(300)));
        let stats = Arc::new(Stats::new());
        let config = SchedulerConfig::default();
        let timer = LifecycleTimer::new(
            request_store.clone(),
            result_store.clone(),
            dimension_index.clone(),
            dedup_cache,
            bot_registry,
            stats,
            config,
        );
        (request_store, result_store, dimension_index, timer)
    }

    fn request(id: u64, expiration_at: chrono::DateTime<chrono::Utc>) -> crate::model::TaskRequest {
        crate::model::TaskRequest {
            id,
            properties: TaskProperties {
                command: vec!["true".into()],
                env: BTreeMap::new(),
                dimensions: BTreeMap::from([("pool".to_string(), BTreeSet::from(["P".to_string()]))]),
                input_refs: vec![],
                hard_timeout_secs: 60,
                io_timeout_secs: 60,
                grace_period_secs: 30,
                idempotent: false,
                secret_bytes: None,
            },
            expiration_at,
            priority: 100,
            tags: vec![],
            service_account: ServiceAccount::None,
            pool_fingerprint: "P".to_string(),
            properties_hash: None,
            created_ts: chrono::Utc::now(),
            allow_retry: true,
        }
    }

    #[tokio::test]
    async fn expires_overdue_pending_requests() {
        let (request_store, result_store, dimension_index, timer) = harness();
        let now = chrono::Utc::now();
        let req = request(1, now - chrono::Duration::seconds(1));
        request_store.create(req.clone()).await.unwrap();
        result_store.init_pending(1, now).await;
        dimension_index.insert("P", 1, 100, now, req.properties.dimensions.clone()).await;

        timer.tick(now).await;

        assert_eq!(result_store.get_summary(1).await.unwrap().state, TaskState::Expired);
        assert_eq!(dimension_index.pool_len("P").await, 0);
    }

    #[tokio::test]
    async fn bot_death_retries_once_then_reinserts_into_index() {
        let (request_store, result_store, dimension_index, timer) = harness();
        let now = chrono::Utc::now();
        let req = request(1, now + chrono::Duration::hours(1));
        request_store.create(req.clone()).await.unwrap();
        result_store.init_pending(1, now).await;
        result_store.try_claim(1, 0, "bot-a", now - chrono::Duration::seconds(600)).await.unwrap();

        timer.tick(now).await;

        assert_eq!(result_store.get_summary(1).await.unwrap().state, TaskState::Pending);
        assert_eq!(dimension_index.pool_len("P").await, 1);
    }
}
