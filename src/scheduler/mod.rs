//! The matching loop: submission, bot claim, bot update, cancellation.
//! This is where the other scheduler submodules meet.

pub mod dedup_cache;
pub mod dimension_index;
pub mod request_store;
pub mod result_store;

use std::sync::Arc;
use tracing::{info, warn};

use crate::acl::AclChecker;
use crate::bots::BotRegistry;
use crate::constants::TERMINATION_PRIORITY;
use crate::error::SwarmError;
use crate::idgen::RequestIdGenerator;
use crate::model::{RequestId, RunId, ServiceAccount, TaskProperties, TaskRequest, TaskRunResult, TaskState};
use crate::validation;

use dedup_cache::DedupCache;
use dimension_index::DimensionIndex;
use request_store::RequestStore;
use result_store::ResultStore;

pub struct SubmitOutcome {
    pub request: TaskRequest,
    pub dedup_hit: Option<TaskRunResult>,
}

pub struct ClaimOutcome {
    pub request: TaskRequest,
    pub run_id: RunId,
    pub manifest: TaskProperties,
}

pub struct BotUpdateOutcome {
    pub must_stop: bool,
    pub ok: bool,
}

pub struct Scheduler {
    pub request_store: Arc<RequestStore>,
    pub result_store: Arc<ResultStore>,
    pub dimension_index: Arc<DimensionIndex>,
    pub dedup_cache: Arc<DedupCache>,
    pub bot_registry: Arc<BotRegistry>,
    acl: Arc<dyn AclChecker>,
    idgen: RequestIdGenerator,
    claim_retry_attempts: u32,
}

impl Scheduler {
    pub fn new(
        request_store: Arc<RequestStore>,
        result_store: Arc<ResultStore>,
        dimension_index: Arc<DimensionIndex>,
        dedup_cache: Arc<DedupCache>,
        bot_registry: Arc<BotRegistry>,
        acl: Arc<dyn AclChecker>,
        claim_retry_attempts: u32,
    ) -> Self {
        Self {
            request_store,
            result_store,
            dimension_index,
            dedup_cache,
            bot_registry,
            acl,
            idgen: RequestIdGenerator::new(),
            claim_retry_attempts,
        }
    }

    /// `tasks.new`: validates, generates an id, tries dedup, and
    /// otherwise publishes the request as PENDING.
    pub async fn schedule(
        &self,
        properties: TaskProperties,
        expiration_at: chrono::DateTime<chrono::Utc>,
        priority: u8,
        tags: Vec<String>,
        service_account: ServiceAccount,
        allow_retry: bool,
    ) -> Result<SubmitOutcome, SwarmError> {
        validation::validate_command(&properties.command)?;
        validation::validate_env(&properties.env)?;
        validation::validate_dimensions(&properties.dimensions)?;
        validation::validate_tags(&tags)?;

        let pool = properties
            .pool()
            .ok_or_else(|| SwarmError::InvalidArgument("dimensions must include a pool".to_string()))?
            .to_string();

        self.acl.check(&pool, &service_account)?;

        let now = chrono::Utc::now();
        let id = self.idgen.next();
        let properties_hash = properties.idempotent.then(|| properties.hash());

        let request = TaskRequest {
            id,
            properties: properties.clone(),
            expiration_at,
            priority,
            tags,
            service_account,
            pool_fingerprint: pool.clone(),
            properties_hash,
            created_ts: now,
            allow_retry,
        };

        self.request_store.create(request.clone()).await?;
        self.result_store.init_pending(id, now).await;

        if let Some(hash) = properties_hash {
            if let Some(entry) = self.dedup_cache.lookup(&hash, now).await {
                if let Some(run) = self.result_store.get_run(entry.run_id).await {
                    if run.state == TaskState::Completed && run.exit_code == Some(0) {
                        self.result_store.complete_as_dedup_hit(id, entry.run_id, now).await;
                        info!(request_id = id, "submission deduped");
                        return Ok(SubmitOutcome { request, dedup_hit: Some(run) });
                    }
                }
            }
        }

        self.dimension_index
            .insert(&pool, id, priority, now, properties.dimensions.clone())
            .await;
        Ok(SubmitOutcome { request, dedup_hit: None })
    }

    /// Bot poll: fast-path reject, then bounded-retry optimistic claim
    /// against the dimension index.
    pub async fn bot_claim(
        &self,
        bot_id: &str,
        dimensions: std::collections::BTreeMap<String, std::collections::BTreeSet<String>>,
        quarantined: bool,
    ) -> Result<Option<ClaimOutcome>, SwarmError> {
        let Some(pool) = dimensions.get("pool").and_then(|s| s.iter().next()) else {
            return Ok(None);
        };
        if quarantined {
            return Ok(None);
        }
        let pool = pool.clone();
        let now = chrono::Utc::now();

        let candidates = self.dimension_index.candidates(&pool, &dimensions).await;
        for request_id in candidates.into_iter().take(self.claim_retry_attempts.max(1) as usize) {
            let Some(summary) = self.result_store.get_summary(request_id).await else {
                continue;
            };
            match self.result_store.try_claim(request_id, summary.version, bot_id, now).await {
                Ok(run_id) => {
                    self.dimension_index.remove(&pool, request_id).await;
                    self.bot_registry.set_current_task(bot_id, request_id, now).await;
                    let request = self
                        .request_store
                        .get(request_id)
                        .await
                        .ok_or_else(|| SwarmError::Internal(format!("request {request_id} missing after claim")))?;
                    info!(request_id, bot_id, try_number = run_id.try_number, "claim succeeded");
                    return Ok(Some(ClaimOutcome {
                        manifest: request.properties.clone(),
                        request,
                        run_id,
                    }));
                }
                Err(SwarmError::Conflict(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(None)
    }

    /// Bot task update: output chunk append plus optional finalization.
    #[allow(clippy::too_many_arguments)]
    pub async fn bot_update(
        &self,
        run_id: RunId,
        output_chunk: Option<(u64, Vec<u8>)>,
        cost_usd: f64,
        exit_code: Option<i32>,
        hard_timeout: bool,
        io_timeout: bool,
    ) -> Result<BotUpdateOutcome, SwarmError> {
        let now = chrono::Utc::now();

        if let Some((start, data)) = output_chunk {
            self.result_store.append_output(run_id, start, &data, now).await?;
        }

        let summary = self
            .result_store
            .get_summary(run_id.request_id)
            .await
            .ok_or_else(|| SwarmError::NotFound(format!("request {}", run_id.request_id)))?;
        let must_stop = summary.killing;

        if must_stop {
            // Terminal update following a kill signal reports KILLED
            // regardless of the exit code the dying process produced.
            self.result_store.mark_killed(run_id, now).await?;
            self.bot_registry
                .clear_current_task(&summary.bot_id.unwrap_or_default(), run_id.request_id, now)
                .await;
            return Ok(BotUpdateOutcome { must_stop: true, ok: true });
        }

        if let Some(exit_code) = exit_code {
            let terminal_state = self
                .result_store
                .complete_run(run_id, exit_code, cost_usd, hard_timeout, io_timeout, now)
                .await?;

            let request = self.request_store.get(run_id.request_id).await;
            if let Some(request) = &request {
                if request.properties.idempotent && terminal_state == TaskState::Completed && exit_code == 0 {
                    if let Some(hash) = request.properties_hash {
                        self.dedup_cache.insert(hash, run_id, now).await;
                    }
                }
            }

            self.bot_registry
                .clear_current_task(&summary.bot_id.unwrap_or_default(), run_id.request_id, now)
                .await;
            return Ok(BotUpdateOutcome { must_stop, ok: true });
        }

        Ok(BotUpdateOutcome { must_stop, ok: true })
    }

    /// `cancel`: PENDING cancels immediately; RUNNING is cooperative via
    /// the `killing` marker.
    pub async fn cancel(&self, request_id: RequestId, kill_running: bool) -> Result<(bool, bool), SwarmError> {
        let now = chrono::Utc::now();
        let summary = self
            .result_store
            .get_summary(request_id)
            .await
            .ok_or_else(|| SwarmError::NotFound(format!("request {request_id}")))?;

        match summary.state {
            TaskState::Pending => {
                let request = self
                    .request_store
                    .get(request_id)
                    .await
                    .ok_or_else(|| SwarmError::Internal(format!("request {request_id} missing")))?;
                self.result_store
                    .mark_terminal_from_pending(request_id, TaskState::Canceled, now)
                    .await?;
                self.dimension_index.remove(&request.pool_fingerprint, request_id).await;
                Ok((true, false))
            }
            TaskState::Running if kill_running => {
                self.result_store.set_killing(request_id, now).await?;
                Ok((true, true))
            }
            TaskState::Running => Ok((false, true)),
            _ => {
                warn!(request_id, state = ?summary.state, "cancel requested on already-terminal request");
                Ok((false, false))
            }
        }
    }

    /// Priority-0 "shut down after current work" signal, matched only to
    /// the named bot.
    pub async fn submit_termination(&self, bot_id: &str) -> Result<SubmitOutcome, SwarmError> {
        let mut dimensions = std::collections::BTreeMap::new();
        dimensions.insert("id".to_string(), std::collections::BTreeSet::from([bot_id.to_string()]));
        dimensions.insert("pool".to_string(), std::collections::BTreeSet::from(["__termination__".to_string()]));

        let properties = TaskProperties {
            command: Vec::new(),
            env: Default::default(),
            dimensions,
            input_refs: Vec::new(),
            hard_timeout_secs: 0,
            io_timeout_secs: 0,
            grace_period_secs: 0,
            idempotent: false,
            secret_bytes: None,
        };
        self.schedule(
            properties,
            chrono::Utc::now() + chrono::Duration::days(1),
            TERMINATION_PRIORITY,
            vec!["kind:termination".to_string()],
            ServiceAccount::Bot,
            false,
        )
        .await
    }
}
