//! Core data model: task requests, result summaries, run records, bots.
//!
//! `TaskRequest` is immutable after creation. `TaskResultSummary` and
//! `TaskRunResult` mutate through the scheduler's state machine only.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// 64-bit request identifier. High bits are time-derived so ids sort
/// in reverse-chronological order; see [`crate::idgen`].
pub type RequestId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProperties {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Required dimensions: key -> set of acceptable values.
    pub dimensions: BTreeMap<String, BTreeSet<String>>,
    pub input_refs: Vec<String>,
    pub hard_timeout_secs: u32,
    pub io_timeout_secs: u32,
    pub grace_period_secs: u32,
    pub idempotent: bool,
    pub secret_bytes: Option<Vec<u8>>,
}

impl TaskProperties {
    /// SHA-256 digest of the canonicalized properties, excluding secret
    /// bytes. Two requests with identical properties (but possibly
    /// different secrets) hash identically, which is what dedup needs.
    pub fn hash(&self) -> [u8; 32] {
        let canon = CanonicalProperties {
            command: &self.command,
            env: &self.env,
            dimensions: &self.dimensions,
            input_refs: &self.input_refs,
            hard_timeout_secs: self.hard_timeout_secs,
            io_timeout_secs: self.io_timeout_secs,
            grace_period_secs: self.grace_period_secs,
        };
        let bytes = serde_json::to_vec(&canon).expect("canonical properties always serialize");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    /// `R ⊆ B`: every required key is present in the bot's dimensions and
    /// every required value is a subset of the bot's values for that key.
    pub fn dimensions_satisfied_by(&self, bot_dims: &BTreeMap<String, BTreeSet<String>>) -> bool {
        self.dimensions.iter().all(|(key, required_values)| {
            bot_dims
                .get(key)
                .is_some_and(|bot_values| required_values.is_subset(bot_values))
        })
    }

    pub fn pool(&self) -> Option<&str> {
        self.dimensions
            .get("pool")
            .and_then(|set| set.iter().next())
            .map(String::as_str)
    }
}

#[derive(Serialize)]
struct CanonicalProperties<'a> {
    command: &'a [String],
    env: &'a BTreeMap<String, String>,
    dimensions: &'a BTreeMap<String, BTreeSet<String>>,
    input_refs: &'a [String],
    hard_timeout_secs: u32,
    io_timeout_secs: u32,
    grace_period_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceAccount {
    None,
    Bot,
    Email(String),
}

/// Immutable task specification, created by `tasks.new` and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: RequestId,
    pub properties: TaskProperties,
    pub expiration_at: chrono::DateTime<chrono::Utc>,
    pub priority: u8,
    pub tags: Vec<String>,
    pub service_account: ServiceAccount,
    pub pool_fingerprint: String,
    pub properties_hash: Option<[u8; 32]>,
    pub created_ts: chrono::DateTime<chrono::Utc>,
    pub allow_retry: bool,
}

impl TaskRequest {
    /// Priority reserved for bot-termination requests.
    pub const TERMINATION_PRIORITY: u8 = 0;

    pub fn is_termination(&self) -> bool {
        self.priority == Self::TERMINATION_PRIORITY
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Expired,
    TimedOut,
    BotDied,
    Canceled,
    Killed,
    NoResource,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// Mutable aggregate state for a request — exactly one per `TaskRequest`,
/// created atomically with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultSummary {
    pub request_id: RequestId,
    pub state: TaskState,
    pub try_number: u8,
    pub current_run_id: Option<RunId>,
    pub deduped_from: Option<RunId>,
    pub created_ts: chrono::DateTime<chrono::Utc>,
    pub started_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub modified_ts: chrono::DateTime<chrono::Utc>,
    pub bot_id: Option<String>,
    pub exit_code: Option<i32>,
    pub output_size: u64,
    /// Set when a RUNNING task has been asked to terminate; cleared once
    /// the bot acknowledges with a KILLED final update.
    pub killing: bool,
    /// Optimistic-concurrency version; bumped on every mutation. Claims
    /// compare-and-swap against this to detect lost races.
    pub version: u64,
}

impl TaskResultSummary {
    pub fn new_pending(request_id: RequestId, created_ts: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            request_id,
            state: TaskState::Pending,
            try_number: 0,
            current_run_id: None,
            deduped_from: None,
            created_ts,
            started_ts: None,
            completed_ts: None,
            modified_ts: created_ts,
            bot_id: None,
            exit_code: None,
            output_size: 0,
            killing: false,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub request_id: RequestId,
    pub try_number: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub id: RunId,
    pub bot_id: String,
    pub state: TaskState,
    pub started_ts: chrono::DateTime<chrono::Utc>,
    pub modified_ts: chrono::DateTime<chrono::Utc>,
    pub completed_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
    pub output_chunks: Vec<OutputChunk>,
    pub cost_usd: f64,
    pub hard_timeout: bool,
    pub io_timeout: bool,
}

impl TaskRunResult {
    pub fn output_len(&self) -> u64 {
        self.output_chunks
            .iter()
            .map(|c| c.start + c.data.len() as u64)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    pub start: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotInfo {
    pub bot_id: String,
    pub dimensions_flat: Vec<String>,
    pub state: serde_json::Value,
    pub external_ip: Option<String>,
    pub authenticated_as: Option<String>,
    pub version: String,
    pub quarantined: bool,
    pub last_seen_ts: chrono::DateTime<chrono::Utc>,
    pub current_task_id: Option<RequestId>,
    pub machine_type: Option<String>,
}

impl BotInfo {
    /// Unflattened dimension view used by the matching predicate.
    pub fn dimensions(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for kv in &self.dimensions_flat {
            if let Some((k, v)) = kv.split_once(':') {
                map.entry(k.to_string()).or_default().insert(v.to_string());
            }
        }
        map
    }

    pub fn pool(&self) -> Option<String> {
        self.dimensions().get("pool").and_then(|s| s.iter().next().cloned())
    }

    pub fn is_idle(&self) -> bool {
        self.current_task_id.is_none() && !self.quarantined
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BotEventKind {
    Handshake,
    Poll,
    Claim { request_id: RequestId },
    Completion { request_id: RequestId },
    Death { request_id: RequestId },
    Quarantine { reason: String },
    DimensionChange,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEvent {
    pub bot_id: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub kind: BotEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub properties_hash: [u8; 32],
    pub run_id: RunId,
    pub completed_ts: chrono::DateTime<chrono::Utc>,
}
