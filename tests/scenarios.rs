//! End-to-end scenarios exercising the scheduler, dimension index, and
//! result store together, as opposed to the unit tests colocated with
//! each module.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use swarm_core::bots::BotRegistry;
use swarm_core::lifecycle::LifecycleTimer;
use swarm_core::model::{ServiceAccount, TaskProperties, TaskState};
use swarm_core::scheduler::dedup_cache::DedupCache;
use swarm_core::scheduler::dimension_index::DimensionIndex;
use swarm_core::scheduler::request_store::RequestStore;
use swarm_core::scheduler::result_store::ResultStore;
use swarm_core::scheduler::Scheduler;
use swarm_core::stats::Stats;

struct Harness {
    scheduler: Scheduler,
    bot_registry: Arc<BotRegistry>,
    request_store: Arc<RequestStore>,
    result_store: Arc<ResultStore>,
    dimension_index: Arc<DimensionIndex>,
    dedup_cache: Arc<DedupCache>,
}

impl Harness {
    fn new() -> Self {
        let request_store = Arc::new(RequestStore::new());
        let result_store = Arc::new(ResultStore::new());
        let dimension_index = Arc::new(DimensionIndex::new());
        let dedup_cache = Arc::new(DedupCache::new(Duration::from_secs(3600)));
        let bot_registry = Arc::new(BotRegistry::new(Duration::from_secs(5)));

        let scheduler = Scheduler::new(
            request_store.clone(),
            result_store.clone(),
            dimension_index.clone(),
            dedup_cache.clone(),
            bot_registry.clone(),
            Arc::new(swarm_core::acl::InMemoryAclChecker::default()),
            5,
        );

        Self {
            scheduler,
            bot_registry,
            request_store,
            result_store,
            dimension_index,
            dedup_cache,
        }
    }

    fn lifecycle_timer(&self) -> LifecycleTimer {
        LifecycleTimer::new(
            self.request_store.clone(),
            self.result_store.clone(),
            self.dimension_index.clone(),
            self.dedup_cache.clone(),
            self.bot_registry.clone(),
            Arc::new(Stats::new()),
            swarm_core::config::SchedulerConfig {
                bot_death_timeout_secs: 5,
                ..Default::default()
            },
        )
    }
}

fn dims(pairs: &[(&str, &str)]) -> BTreeMap<String, BTreeSet<String>> {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (k, v) in pairs {
        map.entry(k.to_string()).or_default().insert(v.to_string());
    }
    map
}

fn properties(dimensions: BTreeMap<String, BTreeSet<String>>, idempotent: bool) -> TaskProperties {
    TaskProperties {
        command: vec!["run.sh".to_string()],
        env: BTreeMap::new(),
        dimensions,
        input_refs: vec![],
        hard_timeout_secs: 60,
        io_timeout_secs: 60,
        grace_period_secs: 30,
        idempotent,
        secret_bytes: None,
    }
}

/// Scenario 1: submit with no bots present — stays PENDING, visible in
/// the dimension index.
#[tokio::test]
async fn scenario_submit_with_no_bots() {
    let h = Harness::new();
    let outcome = h
        .scheduler
        .schedule(
            properties(dims(&[("pool", "P"), ("os", "L")]), false),
            chrono::Utc::now() + chrono::Duration::hours(1),
            100,
            vec![],
            ServiceAccount::None,
            true,
        )
        .await
        .unwrap();

    let summary = h.result_store.get_summary(outcome.request.id).await.unwrap();
    assert_eq!(summary.state, TaskState::Pending);
    assert_eq!(h.dimension_index.pool_len("P").await, 1);
}

/// Scenario 2: a capable bot polls and claims the task.
#[tokio::test]
async fn scenario_bot_claims_matching_task() {
    let h = Harness::new();
    let outcome = h
        .scheduler
        .schedule(
            properties(dims(&[("pool", "P"), ("os", "L")]), false),
            chrono::Utc::now() + chrono::Duration::hours(1),
            100,
            vec![],
            ServiceAccount::None,
            true,
        )
        .await
        .unwrap();

    let bot_dims = dims(&[("pool", "P"), ("os", "L"), ("cpu", "x86")]);
    let claim = h.scheduler.bot_claim("bot-A", bot_dims, false).await.unwrap().unwrap();

    assert_eq!(claim.run_id.try_number, 1);
    assert_eq!(h.dimension_index.pool_len("P").await, 0);
    assert_eq!(
        h.bot_registry.get("bot-A").await.unwrap().current_task_id,
        Some(outcome.request.id)
    );
}

/// Scenario 3: bot reports successful completion.
#[tokio::test]
async fn scenario_bot_completes_task() {
    let h = Harness::new();
    let outcome = h
        .scheduler
        .schedule(
            properties(dims(&[("pool", "P")]), false),
            chrono::Utc::now() + chrono::Duration::hours(1),
            100,
            vec![],
            ServiceAccount::None,
            true,
        )
        .await
        .unwrap();
    let claim = h.scheduler.bot_claim("bot-A", dims(&[("pool", "P")]), false).await.unwrap().unwrap();

    let result = h
        .scheduler
        .bot_update(claim.run_id, None, 0.01, Some(0), false, false)
        .await
        .unwrap();
    assert!(result.ok);

    let summary = h.result_store.get_summary(outcome.request.id).await.unwrap();
    assert_eq!(summary.state, TaskState::Completed);
    assert_eq!(summary.exit_code, Some(0));
    assert!(summary.completed_ts.is_some());
    assert!(h.bot_registry.get("bot-A").await.unwrap().current_task_id.is_none());
}

/// Scenario 4: resubmitting an identical idempotent request dedupes
/// against the prior completed run.
#[tokio::test]
async fn scenario_resubmit_idempotent_dedupes() {
    let h = Harness::new();
    let props = properties(dims(&[("pool", "P")]), true);

    let first = h
        .scheduler
        .schedule(props.clone(), chrono::Utc::now() + chrono::Duration::hours(1), 100, vec![], ServiceAccount::None, true)
        .await
        .unwrap();
    let claim = h.scheduler.bot_claim("bot-A", dims(&[("pool", "P")]), false).await.unwrap().unwrap();
    h.scheduler.bot_update(claim.run_id, None, 0.0, Some(0), false, false).await.unwrap();

    let second = h
        .scheduler
        .schedule(props, chrono::Utc::now() + chrono::Duration::hours(1), 100, vec![], ServiceAccount::None, true)
        .await
        .unwrap();

    assert!(second.dedup_hit.is_some());
    let summary = h.result_store.get_summary(second.request.id).await.unwrap();
    assert_eq!(summary.state, TaskState::Completed);
    assert_eq!(summary.deduped_from, Some(claim.run_id));
    assert_eq!(h.dimension_index.pool_len("P").await, 0);
    let _ = first;
}

/// Scenario 5: a request with a short expiration and no matching bot is
/// swept to EXPIRED.
#[tokio::test]
async fn scenario_expiration_sweep() {
    let h = Harness::new();
    let outcome = h
        .scheduler
        .schedule(
            properties(dims(&[("pool", "P")]), false),
            chrono::Utc::now() + chrono::Duration::seconds(1),
            100,
            vec![],
            ServiceAccount::None,
            true,
        )
        .await
        .unwrap();

    let timer = h.lifecycle_timer();
    let after = chrono::Utc::now() + chrono::Duration::seconds(2);
    timer.tick(after).await;

    let summary = h.result_store.get_summary(outcome.request.id).await.unwrap();
    assert_eq!(summary.state, TaskState::Expired);
    assert_eq!(h.dimension_index.pool_len("P").await, 0);
}

/// Scenario 6: a bot claims a task, streams one output chunk, then goes
/// silent. The sweep reclaims it for a second try.
#[tokio::test]
async fn scenario_bot_death_retries_to_try_two() {
    let h = Harness::new();
    let outcome = h
        .scheduler
        .schedule(
            properties(dims(&[("pool", "P")]), false),
            chrono::Utc::now() + chrono::Duration::hours(1),
            100,
            vec![],
            ServiceAccount::None,
            true,
        )
        .await
        .unwrap();

    let stale_claim_time = chrono::Utc::now() - chrono::Duration::seconds(30);
    let run_id = h
        .result_store
        .try_claim(outcome.request.id, 0, "bot-B", stale_claim_time)
        .await
        .unwrap();
    h.result_store
        .append_output(run_id, 0, b"hi\n", stale_claim_time)
        .await
        .unwrap();

    let timer = h.lifecycle_timer();
    timer.tick(chrono::Utc::now()).await;

    let summary = h.result_store.get_summary(outcome.request.id).await.unwrap();
    assert_eq!(summary.state, TaskState::Pending);

    let next_claim = h
        .scheduler
        .bot_claim("bot-C", dims(&[("pool", "P")]), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next_claim.run_id.try_number, 2);
}
