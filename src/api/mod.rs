//! HTTP transport: routes the RPCs of `SPEC_FULL.md` §6 as JSON over
//! `axum`. Packaging only — none of this is part of the scheduler's
//! testable surface.

use crate::{
    auth::{auth_middleware, create_auth_state},
    bots::{BotFilter, BotRegistry},
    codec::{self, TaskIdKind},
    config::ApiConfig,
    error::SwarmError,
    lifecycle::CancellationWorker,
    model::{RunId, ServiceAccount, TaskProperties},
    rate_limit::{rate_limit_middleware, RateLimitState},
    scheduler::request_store::{Cursor, RequestFilter},
    scheduler::Scheduler,
    stats::Stats,
    Result,
};
use axum::{
    extract::{Path, Query, State},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

const SERVICE_NAME: &str = "swarm-core";
const SERVICE_VERSION: &str = "0.1.0";

const ROUTE_HEALTH: &str = "/health";
const ROUTE_TASKS_NEW: &str = "/swarming/api/v1/tasks/new";
const ROUTE_BOT_POLL: &str = "/swarming/api/v1/bot/poll";
const ROUTE_BOT_UPDATE: &str = "/swarming/api/v1/bot/update";
const ROUTE_TASK_RESULT: &str = "/swarming/api/v1/task/{task_id}/result";
const ROUTE_TASK_REQUEST: &str = "/swarming/api/v1/task/{task_id}/request";
const ROUTE_TASK_STDOUT: &str = "/swarming/api/v1/task/{task_id}/stdout";
const ROUTE_TASKS_LIST: &str = "/swarming/api/v1/tasks/list";
const ROUTE_TASKS_COUNT: &str = "/swarming/api/v1/tasks/count";
const ROUTE_TASKS_CANCEL: &str = "/swarming/api/v1/tasks/cancel";
const ROUTE_TASK_CANCEL: &str = "/swarming/api/v1/task/{task_id}/cancel";
const ROUTE_BOT_GET: &str = "/swarming/api/v1/bot/{bot_id}/get";
const ROUTE_BOTS_LIST: &str = "/swarming/api/v1/bots/list";
const ROUTE_BOTS_COUNT: &str = "/swarming/api/v1/bots/count";

impl IntoResponse for SwarmError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
    bot_registry: Arc<BotRegistry>,
    cancellation_worker: Arc<CancellationWorker>,
    stats: Arc<Stats>,
}

impl ApiServer {
    pub fn new(
        config: ApiConfig,
        scheduler: Arc<Scheduler>,
        bot_registry: Arc<BotRegistry>,
        cancellation_worker: Arc<CancellationWorker>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            config,
            state: AppState {
                scheduler,
                bot_registry,
                cancellation_worker,
                stats,
            },
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
            .await
            .map_err(|e| SwarmError::Internal(e.to_string()))?;

        info!("API server listening on {}:{}", self.config.host, self.config.port);

        axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await
            .map_err(|e| SwarmError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Order matters: rate limit -> auth -> trace -> CORS -> routes.
    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());
        let rate_limit_state = Arc::new(RateLimitState::new());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ])
            .max_age(std::time::Duration::from_secs(3600));

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_TASKS_NEW, post(tasks_new))
            .route(ROUTE_BOT_POLL, post(bot_poll))
            .route(ROUTE_BOT_UPDATE, post(bot_update))
            .route(ROUTE_TASK_RESULT, get(task_result))
            .route(ROUTE_TASK_REQUEST, get(task_request))
            .route(ROUTE_TASK_STDOUT, get(task_stdout))
            .route(ROUTE_TASKS_LIST, get(tasks_list))
            .route(ROUTE_TASKS_COUNT, get(tasks_count))
            .route(ROUTE_TASKS_CANCEL, post(tasks_cancel))
            .route(ROUTE_TASK_CANCEL, post(task_cancel))
            .route(ROUTE_BOT_GET, get(bot_get))
            .route(ROUTE_BOTS_LIST, get(bots_list))
            .route(ROUTE_BOTS_COUNT, get(bots_count))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(rate_limit_state, rate_limit_middleware))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.state.clone())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "status": "ok",
    }))
}

// ---- tasks.new ----

#[derive(Debug, Deserialize)]
struct NewTaskRequest {
    command: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    dimensions: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    input_refs: Vec<String>,
    hard_timeout_secs: u32,
    io_timeout_secs: u32,
    #[serde(default)]
    grace_period_secs: u32,
    #[serde(default)]
    idempotent: bool,
    #[serde(default)]
    secret_bytes_hex: Option<String>,
    expiration_secs: i64,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    service_account: Option<String>,
    #[serde(default = "default_true")]
    allow_retry: bool,
}

fn default_priority() -> u8 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct NewTaskResponse {
    request: crate::model::TaskRequest,
    task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_result: Option<crate::model::TaskRunResult>,
}

async fn tasks_new(
    State(state): State<AppState>,
    Json(body): Json<NewTaskRequest>,
) -> std::result::Result<Json<NewTaskResponse>, SwarmError> {
    let secret_bytes = body
        .secret_bytes_hex
        .map(|s| hex::decode(s).map_err(|e| SwarmError::InvalidArgument(format!("bad secret_bytes_hex: {e}"))))
        .transpose()?;

    let properties = TaskProperties {
        command: body.command,
        env: body.env,
        dimensions: body.dimensions,
        input_refs: body.input_refs,
        hard_timeout_secs: body.hard_timeout_secs,
        io_timeout_secs: body.io_timeout_secs,
        grace_period_secs: body.grace_period_secs,
        idempotent: body.idempotent,
        secret_bytes,
    };
    let expiration_at = chrono::Utc::now() + chrono::Duration::seconds(body.expiration_secs);
    let service_account = match body.service_account.as_deref() {
        None | Some("") => ServiceAccount::None,
        Some("bot") => ServiceAccount::Bot,
        Some(email) => ServiceAccount::Email(email.to_string()),
    };

    let outcome = state
        .scheduler
        .schedule(properties, expiration_at, body.priority, body.tags, service_account, body.allow_retry)
        .await?;

    Ok(Json(NewTaskResponse {
        task_id: codec::pack_summary(outcome.request.id),
        task_result: outcome.dedup_hit,
        request: outcome.request,
    }))
}

// ---- bot poll ----

#[derive(Debug, Deserialize)]
struct BotPollRequest {
    bot_id: String,
    dimensions_flat: Vec<String>,
    #[serde(default)]
    state: serde_json::Value,
    version: String,
    #[serde(default)]
    external_ip: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BotPollResponse {
    Sleep { duration_secs: u64 },
    Run { manifest: TaskManifest },
    Terminate,
    Restart,
    Update { version: String },
}

#[derive(Debug, Serialize)]
struct TaskManifest {
    task_id: String,
    command: Vec<String>,
    env: BTreeMap<String, String>,
    input_refs: Vec<String>,
    hard_timeout_secs: u32,
    io_timeout_secs: u32,
    grace_period_secs: u32,
    secret_bytes_hex: Option<String>,
}

fn flat_to_dimensions(flat: &[String]) -> BTreeMap<String, BTreeSet<String>> {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for kv in flat {
        if let Some((k, v)) = kv.split_once(':') {
            map.entry(k.to_string()).or_default().insert(v.to_string());
        }
    }
    map
}

async fn bot_poll(
    State(state): State<AppState>,
    Json(body): Json<BotPollRequest>,
) -> std::result::Result<Json<BotPollResponse>, SwarmError> {
    let now = chrono::Utc::now();
    state
        .bot_registry
        .poll(&body.bot_id, body.dimensions_flat.clone(), body.state, body.version, body.external_ip, now)
        .await;
    let bot = state.bot_registry.get(&body.bot_id).await;
    let quarantined = bot.as_ref().map(|b| b.quarantined).unwrap_or(true);
    let dimensions = flat_to_dimensions(&body.dimensions_flat);

    let claim = state.scheduler.bot_claim(&body.bot_id, dimensions, quarantined).await?;

    Ok(Json(match claim {
        Some(outcome) => {
            let is_termination = outcome.request.is_termination();
            if is_termination {
                BotPollResponse::Terminate
            } else {
                BotPollResponse::Run {
                    manifest: TaskManifest {
                        task_id: codec::pack_run(outcome.request.id, outcome.run_id.try_number)?,
                        command: outcome.manifest.command,
                        env: outcome.manifest.env,
                        input_refs: outcome.manifest.input_refs,
                        hard_timeout_secs: outcome.manifest.hard_timeout_secs,
                        io_timeout_secs: outcome.manifest.io_timeout_secs,
                        grace_period_secs: outcome.manifest.grace_period_secs,
                        secret_bytes_hex: outcome.manifest.secret_bytes.map(hex::encode),
                    },
                }
            }
        }
        None => BotPollResponse::Sleep { duration_secs: 5 },
    }))
}

// ---- bot update ----

#[derive(Debug, Deserialize)]
struct BotUpdateRequest {
    task_id: String,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    output_hex: Option<String>,
    #[serde(default)]
    output_chunk_start: Option<u64>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    hard_timeout: bool,
    #[serde(default)]
    io_timeout: bool,
}

#[derive(Debug, Serialize)]
struct BotUpdateResponse {
    must_stop: bool,
    ok: bool,
}

fn run_id_from_task_id(task_id: &str) -> std::result::Result<RunId, SwarmError> {
    let (request_id, kind, try_number) = codec::unpack(task_id)?;
    match kind {
        TaskIdKind::Run(_) => Ok(RunId { request_id, try_number }),
        TaskIdKind::Summary => Err(SwarmError::InvalidArgument(
            "bot updates require a run task id, not a summary id".to_string(),
        )),
    }
}

async fn bot_update(
    State(state): State<AppState>,
    Json(body): Json<BotUpdateRequest>,
) -> std::result::Result<Json<BotUpdateResponse>, SwarmError> {
    let run_id = run_id_from_task_id(&body.task_id)?;
    let output_chunk = match (body.output_chunk_start, body.output_hex) {
        (Some(start), Some(hex_data)) => {
            let data = hex::decode(hex_data).map_err(|e| SwarmError::InvalidArgument(format!("bad output_hex: {e}")))?;
            Some((start, data))
        }
        _ => None,
    };

    let outcome = state
        .scheduler
        .bot_update(run_id, output_chunk, body.cost_usd, body.exit_code, body.hard_timeout, body.io_timeout)
        .await?;

    Ok(Json(BotUpdateResponse { must_stop: outcome.must_stop, ok: outcome.ok }))
}

// ---- reads ----

async fn task_request(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<crate::model::TaskRequest>, SwarmError> {
    let (request_id, _, _) = codec::unpack(&task_id)?;
    state
        .scheduler
        .request_store
        .get(request_id)
        .await
        .map(Json)
        .ok_or_else(|| SwarmError::NotFound(format!("task {task_id}")))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TaskResultResponse {
    Summary(crate::model::TaskResultSummary),
    Run(crate::model::TaskRunResult),
}

async fn task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<TaskResultResponse>, SwarmError> {
    let (request_id, kind, try_number) = codec::unpack(&task_id)?;
    match kind {
        TaskIdKind::Summary => state
            .scheduler
            .result_store
            .get_summary(request_id)
            .await
            .map(|s| Json(TaskResultResponse::Summary(s)))
            .ok_or_else(|| SwarmError::NotFound(format!("task {task_id}"))),
        TaskIdKind::Run(_) => state
            .scheduler
            .result_store
            .get_run(RunId { request_id, try_number })
            .await
            .map(|r| Json(TaskResultResponse::Run(r)))
            .ok_or_else(|| SwarmError::NotFound(format!("task {task_id}"))),
    }
}

#[derive(Debug, Serialize)]
struct StdoutResponse {
    output_hex: String,
    length: u64,
}

async fn task_stdout(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<StdoutResponse>, SwarmError> {
    let (request_id, kind, requested_try) = codec::unpack(&task_id)?;
    let try_number = match kind {
        TaskIdKind::Run(_) => requested_try,
        TaskIdKind::Summary => {
            let summary = state
                .scheduler
                .result_store
                .get_summary(request_id)
                .await
                .ok_or_else(|| SwarmError::NotFound(format!("task {task_id}")))?;
            summary
                .current_run_id
                .ok_or_else(|| SwarmError::NotFound("task has not produced output yet".to_string()))?
                .try_number
        }
    };

    let run = state
        .scheduler
        .result_store
        .get_run(RunId { request_id, try_number })
        .await
        .ok_or_else(|| SwarmError::NotFound(format!("task {task_id}")))?;

    let mut chunks = run.output_chunks.clone();
    chunks.sort_by_key(|c| c.start);
    let mut bytes = Vec::new();
    for chunk in &chunks {
        bytes.extend_from_slice(&chunk.data);
    }

    Ok(Json(StdoutResponse { output_hex: hex::encode(&bytes), length: bytes.len() as u64 }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TasksListResponse {
    requests: Vec<crate::model::TaskRequest>,
    cursor: Option<String>,
}

async fn tasks_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> std::result::Result<Json<TasksListResponse>, SwarmError> {
    let tags = query.tags.map(|s| s.split(',').map(str::to_string).collect()).unwrap_or_default();
    let cursor = query.cursor.map(|s| Cursor::decode(&s)).transpose()?;
    let filter = RequestFilter { tags, ..Default::default() };

    let (requests, next_cursor) = state.scheduler.request_store.query(&filter, cursor, query.limit.unwrap_or(100)).await;
    Ok(Json(TasksListResponse { requests, cursor: next_cursor.map(|c| c.encode()) }))
}

#[derive(Debug, Serialize)]
struct TasksCountResponse {
    count: usize,
    by_state: std::collections::HashMap<String, usize>,
}

async fn tasks_count(State(state): State<AppState>) -> Json<TasksCountResponse> {
    let snapshot = state.stats.snapshot().await;
    let by_state: std::collections::HashMap<String, usize> =
        snapshot.tasks_by_state.iter().map(|(k, v)| (format!("{k:?}"), *v)).collect();
    Json(TasksCountResponse { count: by_state.values().sum(), by_state })
}

// ---- cancel ----

#[derive(Debug, Deserialize)]
struct BulkCancelRequest {
    tags: Vec<String>,
    #[serde(default)]
    kill_running: bool,
}

async fn tasks_cancel(
    State(state): State<AppState>,
    Json(body): Json<BulkCancelRequest>,
) -> std::result::Result<Json<crate::lifecycle::BulkCancelReport>, SwarmError> {
    let report = state.cancellation_worker.bulk_cancel(&body.tags, body.kill_running).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    #[serde(default)]
    kill_running: bool,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    accepted: bool,
    was_running: bool,
}

async fn task_cancel(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> std::result::Result<Json<CancelResponse>, SwarmError> {
    let (request_id, _, _) = codec::unpack(&task_id)?;
    let (accepted, was_running) = state.scheduler.cancel(request_id, query.kill_running).await?;
    Ok(Json(CancelResponse { accepted, was_running }))
}

// ---- bots ----

async fn bot_get(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> std::result::Result<Json<crate::model::BotInfo>, SwarmError> {
    state.bot_registry.get(&bot_id).await.map(Json).ok_or_else(|| SwarmError::NotFound(format!("bot {bot_id}")))
}

#[derive(Debug, Deserialize)]
struct BotsListQuery {
    #[serde(default)]
    dimensions: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn bots_list(State(state): State<AppState>, Query(query): Query<BotsListQuery>) -> Json<Vec<crate::model::BotInfo>> {
    let dimensions = flat_to_dimensions(&query.dimensions.map(|s| s.split(',').map(str::to_string).collect::<Vec<String>>()).unwrap_or_default());
    let bots = state.bot_registry.query(&BotFilter { dimensions }, query.limit.unwrap_or(100)).await;
    Json(bots)
}

#[derive(Debug, Serialize)]
struct BotsCountResponse {
    quarantined: usize,
    dead: usize,
    busy: usize,
    idle: usize,
}

async fn bots_count(State(state): State<AppState>) -> Json<BotsCountResponse> {
    let snapshot = state.stats.snapshot().await;
    let counts = snapshot.bot_availability;
    Json(BotsCountResponse {
        quarantined: counts.quarantined,
        dead: counts.dead,
        busy: counts.busy,
        idle: counts.idle,
    })
}
