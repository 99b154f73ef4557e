//! Mutable result summaries and per-attempt run records, and the
//! state machine transitions between them.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::SwarmError;
use crate::model::{OutputChunk, RequestId, RunId, TaskResultSummary, TaskRunResult, TaskState};

#[derive(Default)]
pub struct ResultStore {
    summaries: RwLock<HashMap<RequestId, TaskResultSummary>>,
    runs: RwLock<HashMap<RunId, TaskRunResult>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Created atomically alongside the owning `TaskRequest` — a
    /// `TaskResultSummary` exists iff a `TaskRequest` exists.
    pub async fn init_pending(&self, request_id: RequestId, created_ts: chrono::DateTime<chrono::Utc>) {
        let summary = TaskResultSummary::new_pending(request_id, created_ts);
        self.summaries.write().await.insert(request_id, summary);
    }

    pub async fn get_summary(&self, request_id: RequestId) -> Option<TaskResultSummary> {
        self.summaries.read().await.get(&request_id).cloned()
    }

    pub async fn get_run(&self, run_id: RunId) -> Option<TaskRunResult> {
        self.runs.read().await.get(&run_id).cloned()
    }

    /// Completes an idempotent submission against a prior result without
    /// ever entering RUNNING.
    pub async fn complete_as_dedup_hit(
        &self,
        request_id: RequestId,
        deduped_from: RunId,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let mut summaries = self.summaries.write().await;
        if let Some(summary) = summaries.get_mut(&request_id) {
            summary.state = TaskState::Completed;
            summary.deduped_from = Some(deduped_from);
            summary.completed_ts = Some(now);
            summary.modified_ts = now;
            summary.version += 1;
        }
    }

    /// Optimistic-concurrency claim: PENDING -> RUNNING, with a
    /// compare-and-swap against `expected_version` so a concurrent
    /// claimant on the same request loses cleanly.
    pub async fn try_claim(
        &self,
        request_id: RequestId,
        expected_version: u64,
        bot_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<RunId, SwarmError> {
        let mut summaries = self.summaries.write().await;
        let summary = summaries
            .get_mut(&request_id)
            .ok_or_else(|| SwarmError::NotFound(format!("request {request_id}")))?;

        if summary.state != TaskState::Pending || summary.version != expected_version {
            return Err(SwarmError::Conflict(format!(
                "request {request_id} no longer claimable (lost race)"
            )));
        }

        let try_number = summary.try_number + 1;
        let run_id = RunId { request_id, try_number };

        summary.state = TaskState::Running;
        summary.try_number = try_number;
        summary.current_run_id = Some(run_id);
        summary.started_ts.get_or_insert(now);
        summary.modified_ts = now;
        summary.bot_id = Some(bot_id.to_string());
        summary.version += 1;
        drop(summaries);

        let run = TaskRunResult {
            id: run_id,
            bot_id: bot_id.to_string(),
            state: TaskState::Running,
            started_ts: now,
            modified_ts: now,
            completed_ts: None,
            exit_code: None,
            output_chunks: Vec::new(),
            cost_usd: 0.0,
            hard_timeout: false,
            io_timeout: false,
        };
        self.runs.write().await.insert(run_id, run);
        debug!(request_id, try_number, bot_id, "claim accepted");
        Ok(run_id)
    }

    /// Appends an output chunk. Accepts only a chunk starting exactly at
    /// the current persisted length (no gaps); a retransmit of
    /// already-persisted, identical bytes is a harmless no-op; anything
    /// else overlapping is rejected.
    pub async fn append_output(
        &self,
        run_id: RunId,
        start: u64,
        data: &[u8],
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), SwarmError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| SwarmError::NotFound(format!("run {run_id:?}")))?;

        let persisted_len = run.output_len();
        if start == persisted_len {
            run.output_chunks.push(OutputChunk {
                start,
                data: data.to_vec(),
            });
        } else if start < persisted_len {
            let is_retransmit = run
                .output_chunks
                .iter()
                .any(|c| c.start == start && c.data == data);
            if !is_retransmit {
                return Err(SwarmError::FailedPrecondition(format!(
                    "output chunk at {start} overlaps already-persisted data"
                )));
            }
        } else {
            return Err(SwarmError::FailedPrecondition(format!(
                "output chunk at {start} leaves a gap past persisted length {persisted_len}"
            )));
        }
        run.modified_ts = now;
        Ok(())
    }

    /// Final bot update: transitions the run and summary to a terminal
    /// state and releases the bot.
    pub async fn complete_run(
        &self,
        run_id: RunId,
        exit_code: i32,
        cost_usd: f64,
        hard_timeout: bool,
        io_timeout: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<TaskState, SwarmError> {
        let terminal_state = if hard_timeout || io_timeout {
            TaskState::TimedOut
        } else {
            TaskState::Completed
        };

        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| SwarmError::NotFound(format!("run {run_id:?}")))?;
        run.state = terminal_state;
        run.exit_code = Some(exit_code);
        run.cost_usd = cost_usd;
        run.hard_timeout = hard_timeout;
        run.io_timeout = io_timeout;
        run.completed_ts = Some(now);
        run.modified_ts = now;
        let output_size = run.output_len();
        drop(runs);

        let mut summaries = self.summaries.write().await;
        if let Some(summary) = summaries.get_mut(&run_id.request_id) {
            summary.state = terminal_state;
            summary.exit_code = Some(exit_code);
            summary.completed_ts = Some(now);
            summary.modified_ts = now;
            summary.output_size = output_size;
            summary.killing = false;
            summary.version += 1;
        }
        Ok(terminal_state)
    }

    /// Sets or clears the cooperative-cancellation marker on a RUNNING
    /// summary.
    pub async fn set_killing(&self, request_id: RequestId, now: chrono::DateTime<chrono::Utc>) -> Result<(), SwarmError> {
        let mut summaries = self.summaries.write().await;
        let summary = summaries
            .get_mut(&request_id)
            .ok_or_else(|| SwarmError::NotFound(format!("request {request_id}")))?;
        if summary.state != TaskState::Running {
            return Err(SwarmError::FailedPrecondition(format!(
                "request {request_id} is not running"
            )));
        }
        summary.killing = true;
        summary.modified_ts = now;
        summary.version += 1;
        Ok(())
    }

    /// Bot acknowledged a kill signal: finalizes the run as KILLED.
    pub async fn mark_killed(&self, run_id: RunId, now: chrono::DateTime<chrono::Utc>) -> Result<(), SwarmError> {
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get_mut(&run_id) {
            run.state = TaskState::Killed;
            run.completed_ts = Some(now);
            run.modified_ts = now;
        }
        drop(runs);

        let mut summaries = self.summaries.write().await;
        if let Some(summary) = summaries.get_mut(&run_id.request_id) {
            summary.state = TaskState::Killed;
            summary.completed_ts = Some(now);
            summary.modified_ts = now;
            summary.killing = false;
            summary.version += 1;
        }
        Ok(())
    }

    /// Transitions a PENDING summary directly to a terminal state
    /// without a run (CANCELED, EXPIRED, NO_RESOURCE).
    pub async fn mark_terminal_from_pending(
        &self,
        request_id: RequestId,
        state: TaskState,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), SwarmError> {
        let mut summaries = self.summaries.write().await;
        let summary = summaries
            .get_mut(&request_id)
            .ok_or_else(|| SwarmError::NotFound(format!("request {request_id}")))?;
        if summary.state != TaskState::Pending {
            return Err(SwarmError::FailedPrecondition(format!(
                "request {request_id} is not pending"
            )));
        }
        summary.state = state;
        summary.completed_ts = Some(now);
        summary.modified_ts = now;
        summary.version += 1;
        Ok(())
    }

    /// Bot-death sweep outcome for a RUNNING summary whose run went
    /// silent: either a single retry to `try_number=2`, or a terminal
    /// BOT_DIED if the retry budget is spent.
    pub async fn reclaim_dead_run(
        &self,
        request_id: RequestId,
        allow_retry: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, SwarmError> {
        let mut summaries = self.summaries.write().await;
        let summary = summaries
            .get_mut(&request_id)
            .ok_or_else(|| SwarmError::NotFound(format!("request {request_id}")))?;

        let run_id = summary.current_run_id;
        let retriable = allow_retry && summary.try_number == 1;

        if retriable {
            summary.state = TaskState::Pending;
            summary.current_run_id = None;
            summary.bot_id = None;
            summary.modified_ts = now;
            summary.version += 1;
        } else {
            summary.state = TaskState::BotDied;
            summary.completed_ts = Some(now);
            summary.modified_ts = now;
            summary.version += 1;
        }
        drop(summaries);

        if let Some(run_id) = run_id {
            if let Some(run) = self.runs.write().await.get_mut(&run_id) {
                run.state = TaskState::BotDied;
                run.completed_ts = Some(now);
                run.modified_ts = now;
            }
        } else {
            warn!(request_id, "reclaiming dead run with no current_run_id on record");
        }

        Ok(retriable)
    }

    /// Summaries currently RUNNING whose run has gone quiet, used by the
    /// lifecycle sweep to find candidates without scanning every run.
    pub async fn running_stale_since(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Vec<RequestId> {
        let summaries = self.summaries.read().await;
        let runs = self.runs.read().await;
        summaries
            .values()
            .filter(|s| s.state == TaskState::Running)
            .filter(|s| {
                s.current_run_id
                    .and_then(|id| runs.get(&id))
                    .is_some_and(|run| run.modified_ts < cutoff)
            })
            .map(|s| s.request_id)
            .collect()
    }

    pub async fn pending_ids(&self) -> Vec<RequestId> {
        self.summaries
            .read()
            .await
            .values()
            .filter(|s| s.state == TaskState::Pending)
            .map(|s| s.request_id)
            .collect()
    }

    pub async fn pending_past_expiration(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        expirations: &HashMap<RequestId, chrono::DateTime<chrono::Utc>>,
    ) -> Vec<RequestId> {
        self.summaries
            .read()
            .await
            .values()
            .filter(|s| s.state == TaskState::Pending)
            .filter(|s| expirations.get(&s.request_id).is_some_and(|exp| *exp <= now))
            .map(|s| s.request_id)
            .collect()
    }

    pub async fn count_by_state(&self) -> HashMap<TaskState, usize> {
        let mut counts = HashMap::new();
        for summary in self.summaries.read().await.values() {
            *counts.entry(summary.state).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_transitions_pending_to_running() {
        let store = ResultStore::new();
        let now = chrono::Utc::now();
        store.init_pending(1, now).await;

        let run_id = store.try_claim(1, 0, "bot-a", now).await.unwrap();
        assert_eq!(run_id.try_number, 1);

        let summary = store.get_summary(1).await.unwrap();
        assert_eq!(summary.state, TaskState::Running);
        assert_eq!(summary.version, 1);
    }

    #[tokio::test]
    async fn second_claim_on_stale_version_loses_race() {
        let store = ResultStore::new();
        let now = chrono::Utc::now();
        store.init_pending(1, now).await;
        store.try_claim(1, 0, "bot-a", now).await.unwrap();

        let result = store.try_claim(1, 0, "bot-b", now).await;
        assert!(matches!(result, Err(SwarmError::Conflict(_))));
    }

    #[tokio::test]
    async fn output_chunks_reject_gaps_and_overlaps() {
        let store = ResultStore::new();
        let now = chrono::Utc::now();
        store.init_pending(1, now).await;
        let run_id = store.try_claim(1, 0, "bot-a", now).await.unwrap();

        store.append_output(run_id, 0, b"hello", now).await.unwrap();
        assert!(store.append_output(run_id, 10, b"gap", now).await.is_err());
        store.append_output(run_id, 0, b"hello", now).await.unwrap(); // idempotent retransmit
        assert!(store.append_output(run_id, 3, b"xx", now).await.is_err()); // true overlap
        store.append_output(run_id, 5, b" world", now).await.unwrap();

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.output_len(), 11);
    }

    #[tokio::test]
    async fn complete_run_marks_summary_terminal() {
        let store = ResultStore::new();
        let now = chrono::Utc::now();
        store.init_pending(1, now).await;
        let run_id = store.try_claim(1, 0, "bot-a", now).await.unwrap();

        let state = store.complete_run(run_id, 0, 0.01, false, false, now).await.unwrap();
        assert_eq!(state, TaskState::Completed);

        let summary = store.get_summary(1).await.unwrap();
        assert_eq!(summary.state, TaskState::Completed);
        assert_eq!(summary.exit_code, Some(0));
    }

    #[tokio::test]
    async fn reclaim_retries_once_then_terminates() {
        let store = ResultStore::new();
        let now = chrono::Utc::now();
        store.init_pending(1, now).await;
        store.try_claim(1, 0, "bot-a", now).await.unwrap();

        let retried = store.reclaim_dead_run(1, true, now).await.unwrap();
        assert!(retried);
        assert_eq!(store.get_summary(1).await.unwrap().state, TaskState::Pending);

        let version = store.get_summary(1).await.unwrap().version;
        store.try_claim(1, version, "bot-b", now).await.unwrap();
        let retried_again = store.reclaim_dead_run(1, true, now).await.unwrap();
        assert!(!retried_again);
        assert_eq!(store.get_summary(1).await.unwrap().state, TaskState::BotDied);
    }
}
