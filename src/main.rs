use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::acl::InMemoryAclChecker;
use swarm_core::api::ApiServer;
use swarm_core::bots::BotRegistry;
use swarm_core::config::SwarmConfig;
use swarm_core::lifecycle::{CancellationWorker, LifecycleTimer};
use swarm_core::scheduler::dedup_cache::DedupCache;
use swarm_core::scheduler::dimension_index::DimensionIndex;
use swarm_core::scheduler::request_store::RequestStore;
use swarm_core::scheduler::result_store::ResultStore;
use swarm_core::scheduler::Scheduler;
use swarm_core::stats::Stats;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting swarm-core scheduling service");

    let config = SwarmConfig::load()?;

    let request_store = Arc::new(RequestStore::new());
    let result_store = Arc::new(ResultStore::new());
    let dimension_index = Arc::new(DimensionIndex::new());
    let dedup_cache = Arc::new(DedupCache::new(Duration::from_secs(config.scheduler.dedup_ttl_secs)));
    let bot_registry = Arc::new(BotRegistry::new(Duration::from_secs(config.scheduler.bot_death_timeout_secs)));
    let stats = Arc::new(Stats::new());
    let acl = Arc::new(InMemoryAclChecker::new(config.scheduler.pool_acl.clone()));

    let scheduler = Arc::new(Scheduler::new(
        request_store.clone(),
        result_store.clone(),
        dimension_index.clone(),
        dedup_cache.clone(),
        bot_registry.clone(),
        acl,
        config.scheduler.claim_retry_attempts,
    ));

    let cancellation_worker = Arc::new(CancellationWorker::new(
        scheduler.clone(),
        request_store.clone(),
        result_store.clone(),
    ));

    let lifecycle_timer = Arc::new(LifecycleTimer::new(
        request_store,
        result_store,
        dimension_index,
        dedup_cache,
        bot_registry.clone(),
        stats.clone(),
        config.scheduler.clone(),
    ));

    let api_server = ApiServer::new(config.api.clone(), scheduler, bot_registry, cancellation_worker, stats);

    let timer_handle = lifecycle_timer.spawn();

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("API server failed: {}", e);
            }
        }
        result = timer_handle => {
            if let Err(e) = result {
                error!("lifecycle timer task panicked: {}", e);
            }
        }
    }

    Ok(())
}
