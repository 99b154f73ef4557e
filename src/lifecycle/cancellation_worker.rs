//! Fans a tag-filtered bulk cancel out into individual request
//! cancellations.

use std::sync::Arc;
use tracing::info;

use crate::error::SwarmError;
use crate::model::TaskState;
use crate::scheduler::request_store::{RequestFilter, RequestStore};
use crate::scheduler::result_store::ResultStore;
use crate::scheduler::Scheduler;

#[derive(Debug, serde::Serialize)]
pub struct BulkCancelReport {
    pub matched: usize,
    pub canceled: usize,
}

pub struct CancellationWorker {
    scheduler: Arc<Scheduler>,
    request_store: Arc<RequestStore>,
    result_store: Arc<ResultStore>,
}

impl CancellationWorker {
    pub fn new(scheduler: Arc<Scheduler>, request_store: Arc<RequestStore>, result_store: Arc<ResultStore>) -> Self {
        Self {
            scheduler,
            request_store,
            result_store,
        }
    }

    /// Cancels every request matching every tag in `tags`. PENDING-only
    /// by default; `kill_running` additionally signals RUNNING matches
    /// cooperatively. Restartable: the caller can re-invoke with the
    /// same tags and it converges, since already-terminal requests are
    /// simply skipped, rather than requiring a separately persisted
    /// cursor across calls.
    pub async fn bulk_cancel(&self, tags: &[String], kill_running: bool) -> Result<BulkCancelReport, SwarmError> {
        let filter = RequestFilter {
            tags: tags.to_vec(),
            ..Default::default()
        };

        let mut matched = 0;
        let mut canceled = 0;
        let mut cursor = None;
        loop {
            let (page, next_cursor) = self.request_store.query(&filter, cursor, 200).await;
            if page.is_empty() {
                break;
            }
            for request in page {
                let Some(summary) = self.result_store.get_summary(request.id).await else {
                    continue;
                };
                if summary.state != TaskState::Pending && !(kill_running && summary.state == TaskState::Running) {
                    continue;
                }
                matched += 1;
                if let Ok((accepted, _)) = self.scheduler.cancel(request.id, kill_running).await {
                    if accepted {
                        canceled += 1;
                    }
                }
            }
            cursor = next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        info!(matched, canceled, tags = ?tags, "bulk cancel completed");
        Ok(BulkCancelReport { matched, canceled })
    }
}
