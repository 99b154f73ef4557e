//! Immutable task-request storage, keyed by the monotonic ids from
//! [`crate::idgen`].

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::error::SwarmError;
use crate::model::{RequestId, TaskRequest};

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    /// A request matches if it carries every tag listed here.
    pub tags: Vec<String>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
}

/// Opaque to callers; encodes the last-seen request id so pagination
/// remains monotonic within one cursor chain even as new requests land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(RequestId);

impl Cursor {
    pub fn encode(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn decode(s: &str) -> Result<Self, SwarmError> {
        u64::from_str_radix(s, 16)
            .map(Cursor)
            .map_err(|_| SwarmError::InvalidArgument(format!("malformed cursor: {s}")))
    }
}

#[derive(Default)]
pub struct RequestStore {
    requests: RwLock<HashMap<RequestId, TaskRequest>>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, request: TaskRequest) -> Result<(), SwarmError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(SwarmError::Conflict(format!(
                "request id {} already exists",
                request.id
            )));
        }
        debug!(request_id = request.id, "request stored");
        requests.insert(request.id, request);
        Ok(())
    }

    pub async fn get(&self, id: RequestId) -> Option<TaskRequest> {
        self.requests.read().await.get(&id).cloned()
    }

    /// Full snapshot for lifecycle sweeps and stats aggregation, which
    /// need fields (`expiration_at`, `pool_fingerprint`, `allow_retry`)
    /// that a tag/time-window query does not surface.
    pub async fn all(&self) -> Vec<TaskRequest> {
        self.requests.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Requests sort newest-first (ids are reverse-chronological by
    /// construction).
    pub async fn query(
        &self,
        filter: &RequestFilter,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> (Vec<TaskRequest>, Option<Cursor>) {
        let limit = if limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            limit.min(MAX_PAGE_SIZE)
        };
        let requests = self.requests.read().await;

        let mut matching: Vec<&TaskRequest> = requests
            .values()
            .filter(|r| filter.tags.iter().all(|t| r.tags.contains(t)))
            .filter(|r| filter.created_after.map_or(true, |after| r.created_ts > after))
            .filter(|r| filter.created_before.map_or(true, |before| r.created_ts < before))
            .filter(|r| cursor.map_or(true, |c| r.id > c.0))
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));

        let next_cursor = matching.get(limit).map(|r| Cursor(r.id));
        matching.truncate(limit);
        (matching.into_iter().cloned().collect(), next_cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceAccount, TaskProperties};
    use std::collections::{BTreeMap, BTreeSet};

    fn request(id: RequestId, tags: &[&str]) -> TaskRequest {
        TaskRequest {
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
            expiration_at: chrono::Utc::now() + chrono::Duration::hours(1),
            priority: 100,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            service_account: ServiceAccount::None,
            pool_fingerprint: "P".to_string(),
            properties_hash: None,
            created_ts: chrono::Utc::now(),
            allow_retry: true,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = RequestStore::new();
        store.create(request(1, &[])).await.unwrap();
        assert!(matches!(
            store.create(request(1, &[])).await,
            Err(SwarmError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn query_filters_by_tag() {
        let store = RequestStore::new();
        store.create(request(1, &["branch:main"])).await.unwrap();
        store.create(request(2, &["branch:dev"])).await.unwrap();

        let filter = RequestFilter {
            tags: vec!["branch:main".to_string()],
            ..Default::default()
        };
        let (results, _) = store.query(&filter, None, 10).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
    }

    #[tokio::test]
    async fn query_paginates_newest_first() {
        use crate::idgen::RequestIdGenerator;

        let store = RequestStore::new();
        let idgen = RequestIdGenerator::new();
        // Sleep between calls so each id lands in a distinct millisecond and
        // strictly decreases (ids.rs's own convention: later == smaller), so
        // insertion order here is oldest-to-newest and `ids` is already in
        // descending (newest-last) order.
        let mut ids: Vec<RequestId> = Vec::new();
        for _ in 0..5 {
            ids.push(idgen.next());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        for &id in &ids {
            store.create(request(id, &[])).await.unwrap();
        }
        let newest_first: Vec<RequestId> = ids.iter().rev().copied().collect();

        let (page1, cursor) = store.query(&RequestFilter::default(), None, 2).await;
        assert_eq!(
            page1.iter().map(|r| r.id).collect::<Vec<_>>(),
            newest_first[0..2]
        );
        let cursor = cursor.unwrap();

        let (page2, _) = store.query(&RequestFilter::default(), Some(cursor), 2).await;
        assert_eq!(
            page2.iter().map(|r| r.id).collect::<Vec<_>>(),
            newest_first[2..4]
        );
    }
}
