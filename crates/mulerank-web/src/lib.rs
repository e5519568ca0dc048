//! JSON API over the agent store, the run pipeline and the scheduler.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use mulerank_core::{history_with_movements, Agent, AgentStats, RankChange, RankObservation, RunSummary};
use mulerank_storage::{AgentStore, SnapshotStore, StoreError};
use mulerank_sync::{
    build_pipeline, recent_run_reports, shutdown_signal, RunError, RunReport, Scheduler, SchedulerError,
    SyncConfig, SyncPipeline,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

mod tasks;

pub use tasks::{TaskRecord, TaskRegistry, TaskStatus};

pub const API_KEY_HEADER: &str = "x-api-key";
const MAX_LIMIT: i64 = 1000;
const DEFAULT_TASK_LIMIT: i64 = 50;
const DEFAULT_CHANGES_LIMIT: i64 = 10;
const DEFAULT_REPORT_LIMIT: i64 = 20;

pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub store: Arc<dyn AgentStore>,
    pub tasks: TaskRegistry,
    pub scheduler: Scheduler,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, scheduler: Scheduler) -> Self {
        Self {
            store: pipeline.store(),
            api_key: pipeline.config().api_key.clone(),
            pipeline,
            tasks: TaskRegistry::new(),
            scheduler,
        }
    }
}

#[derive(Debug)]
enum ApiError {
    Unprocessable(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store query failed");
        Self::Internal(err.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidInterval(_) => Self::Unprocessable(err.to_string()),
            SchedulerError::Job(err) => {
                error!(error = %format!("{err:#}"), "scheduler job failed");
                Self::Internal(format!("{err:#}"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::Unprocessable(d) => (StatusCode::UNPROCESSABLE_ENTITY, d),
            Self::NotFound(d) => (StatusCode::NOT_FOUND, d),
            Self::Conflict(d) => (StatusCode::CONFLICT, d),
            Self::Internal(d) => (StatusCode::INTERNAL_SERVER_ERROR, d),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn checked_limit(limit: Option<i64>, default: i64) -> Result<i64, ApiError> {
    let limit = limit.unwrap_or(default);
    if (1..=MAX_LIMIT).contains(&limit) {
        Ok(limit)
    } else {
        Err(ApiError::Unprocessable(format!("limit must be between 1 and {MAX_LIMIT}")))
    }
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let protected = Router::new()
        .route("/api/agents", get(list_agents_handler))
        .route("/api/agents/statistics", get(statistics_handler))
        .route("/api/agents/history", get(history_handler))
        .route("/api/agents/by-link", get(agent_by_link_handler))
        .route("/api/crawl/start", post(crawl_start_handler))
        .route("/api/tasks", get(list_tasks_handler))
        .route("/api/tasks/scheduler/status", get(scheduler_status_handler))
        .route("/api/tasks/scheduler/start", post(scheduler_start_handler))
        .route("/api/tasks/scheduler/stop", post(scheduler_stop_handler))
        .route("/api/tasks/scheduler/config", put(scheduler_config_handler))
        .route("/api/reports", get(list_reports_handler))
        .route("/api/runs/{run_id}/snapshots", get(run_snapshots_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_api_key));

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/crawl/status/{task_id}", get(task_status_handler))
        .route("/api/tasks/{task_id}", get(task_status_handler))
        .merge(protected)
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("api stopped");
    Ok(())
}

/// Serves the API on `MULERANK_WEB_PORT`, optionally with the periodic
/// crawl scheduler running alongside. The scheduler can also be started
/// and stopped through the API.
pub async fn serve_from_env(with_scheduler: bool) -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let port = config.web_port;
    if config.api_key.is_none() {
        warn!("API_KEY is not set, the api accepts unauthenticated requests");
    }
    let pipeline = Arc::new(build_pipeline(config).await?);
    let scheduler = Scheduler::new(Arc::clone(&pipeline));
    if with_scheduler {
        scheduler.start(false).await?;
    }

    serve(AppState::new(pipeline, scheduler.clone()), port).await?;
    scheduler.stop().await?;
    Ok(())
}

async fn require_api_key(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    let rejection = match request.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(key) if key == expected => None,
        Some(_) => Some((StatusCode::FORBIDDEN, "invalid API key")),
        None => Some((StatusCode::UNAUTHORIZED, "missing API key")),
    };
    match rejection {
        Some((status, detail)) => auth_error(status, detail),
        None => next.run(request).await,
    }
}

fn auth_error(status: StatusCode, detail: &str) -> Response {
    let mut resp = (status, Json(json!({ "detail": detail }))).into_response();
    resp.headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("ApiKey"));
    resp
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "service": "mulerank",
    }))
}

#[derive(Debug, Deserialize)]
struct AgentsQuery {
    active_only: Option<bool>,
    limit: Option<i64>,
}

async fn list_agents_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentsQuery>,
) -> ApiResult<Vec<Agent>> {
    let limit = match query.limit {
        Some(_) => Some(checked_limit(query.limit, MAX_LIMIT)?),
        None => None,
    };
    let agents = state
        .store
        .list_agents(query.active_only.unwrap_or(true), limit)
        .await?;
    Ok(Json(agents))
}

#[derive(Debug, Deserialize)]
struct StatisticsQuery {
    changes_limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct StatisticsResponse {
    #[serde(flatten)]
    stats: AgentStats,
    rank_changes: Vec<RankChange>,
}

async fn statistics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatisticsQuery>,
) -> ApiResult<StatisticsResponse> {
    let limit = checked_limit(query.changes_limit, DEFAULT_CHANGES_LIMIT)?;
    let stats = state.store.get_stats().await?;
    let rank_changes = state.store.rank_changes(limit).await?;
    Ok(Json(StatisticsResponse { stats, rank_changes }))
}

#[derive(Debug, Deserialize)]
struct LinkQuery {
    link: String,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    agent: Agent,
    history: Vec<RankObservation>,
}

async fn find_agent(state: &AppState, link: &str) -> Result<Agent, ApiError> {
    state
        .store
        .get_agent(link)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent {link} not found")))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LinkQuery>,
) -> ApiResult<HistoryResponse> {
    let agent = find_agent(&state, &query.link).await?;
    let history = state.store.get_history(&agent.link).await?;
    Ok(Json(HistoryResponse {
        agent,
        history: history_with_movements(&history),
    }))
}

async fn agent_by_link_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LinkQuery>,
) -> ApiResult<Agent> {
    Ok(Json(find_agent(&state, &query.link).await?))
}

#[derive(Debug, Deserialize)]
struct CrawlRequest {
    #[serde(default = "default_async_mode")]
    async_mode: bool,
}

fn default_async_mode() -> bool {
    true
}

/// Runs the pipeline for `task_id` and records the outcome in the registry.
async fn run_task(state: &AppState, task_id: Uuid) -> Result<RunSummary, RunError> {
    state.tasks.mark_running(task_id).await;
    let result = state.pipeline.run_once().await;
    match &result {
        Ok(summary) => {
            info!(%task_id, run_id = %summary.run_id, "crawl task completed");
            state.tasks.complete(task_id, summary.clone()).await;
        }
        Err(err) => {
            warn!(%task_id, kind = err.kind(), error = %err, "crawl task failed");
            state.tasks.fail(task_id, err.to_string()).await;
        }
    }
    result
}

async fn crawl_start_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CrawlRequest>>,
) -> ApiResult<serde_json::Value> {
    let async_mode = body.map(|Json(req)| req.async_mode).unwrap_or_else(default_async_mode);
    if state.pipeline.is_running() {
        return Err(ApiError::Conflict("a crawl is already running".into()));
    }
    let task = state.tasks.create().await;
    let task_id = task.task_id;

    if async_mode {
        let background = Arc::clone(&state);
        tokio::spawn(async move {
            let _ = run_task(&background, task_id).await;
        });
        return Ok(Json(json!({
            "task_id": task_id,
            "message": "crawl task started",
            "status": TaskStatus::Pending,
        })));
    }

    match run_task(&state, task_id).await {
        Ok(summary) => Ok(Json(json!({
            "task_id": task_id,
            "message": "crawl completed",
            "status": TaskStatus::Completed,
            "result": summary,
        }))),
        Err(RunError::AlreadyRunning) => Err(ApiError::Conflict("a crawl is already running".into())),
        Err(err) => Err(ApiError::Internal(format!("crawl failed: {err}"))),
    }
}

async fn task_status_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<TaskRecord> {
    state
        .tasks
        .get(task_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task {task_id} not found")))
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    limit: Option<i64>,
}

async fn list_tasks_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TasksQuery>,
) -> ApiResult<serde_json::Value> {
    let limit = checked_limit(query.limit, DEFAULT_TASK_LIMIT)?;
    let tasks = state.tasks.list(limit as usize).await;
    Ok(Json(json!({
        "tasks": tasks,
        "total": state.tasks.len().await,
    })))
}

async fn scheduler_status(state: &AppState) -> serde_json::Value {
    let scheduler = state.scheduler.state().read().await.clone();
    json!({
        "enabled": scheduler.enabled,
        "interval_hours": scheduler.interval_hours,
        "is_running": scheduler.is_running || state.pipeline.is_running(),
        "next_run_time": scheduler.next_run_at,
        "last_run_time": scheduler.last_run_at,
        "last_error": scheduler.last_error,
        "skipped_ticks": scheduler.skipped_ticks,
    })
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(scheduler_status(&state).await)
}

#[derive(Debug, Deserialize)]
struct SchedulerStartRequest {
    #[serde(default)]
    run_immediately: bool,
}

async fn scheduler_start_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SchedulerStartRequest>>,
) -> ApiResult<serde_json::Value> {
    let run_immediately = body.is_some_and(|Json(req)| req.run_immediately);
    let started = state
        .scheduler
        .start(run_immediately)
        .await
        .map_err(SchedulerError::from)?;
    if !started {
        return Err(ApiError::Conflict("scheduler is already running".into()));
    }
    Ok(Json(scheduler_status(&state).await))
}

async fn scheduler_stop_handler(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let stopped = state.scheduler.stop().await.map_err(SchedulerError::from)?;
    if !stopped {
        return Err(ApiError::Conflict("scheduler is not running".into()));
    }
    Ok(Json(scheduler_status(&state).await))
}

#[derive(Debug, Deserialize)]
struct SchedulerConfigRequest {
    interval_hours: u64,
}

async fn scheduler_config_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SchedulerConfigRequest>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.set_interval(req.interval_hours).await?;
    Ok(Json(scheduler_status(&state).await))
}

#[derive(Debug, Deserialize)]
struct ReportsQuery {
    limit: Option<i64>,
}

async fn list_reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportsQuery>,
) -> ApiResult<Vec<RunReport>> {
    let limit = checked_limit(query.limit, DEFAULT_REPORT_LIMIT)?;
    let reports = recent_run_reports(&state.pipeline.config().reports_dir, limit as usize)
        .await
        .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
    Ok(Json(reports))
}

async fn run_snapshots_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let pages = SnapshotStore::new(state.pipeline.config().artifacts_dir.clone())
        .pages_for_run(run_id)
        .await
        .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
    let pages = pages
        .iter()
        .map(|p| {
            json!({
                "page": p.page,
                "path": p.path.display().to_string(),
                "sha256": p.sha256,
                "byte_size": p.byte_size,
            })
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "run_id": run_id, "pages": pages })))
}
