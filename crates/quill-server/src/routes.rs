use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use quill_core::{
    dispatch::{DispatchError, DispatchOutcome, Invocation},
    jobs::JobKind,
    pipeline::create_pipeline_tasks,
    queue::QueueError,
    NewTask, TaskPatch,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::AppState;

const DEFAULT_HISTORY_PAGE: usize = 50;

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn queue_error(e: QueueError) -> StatusCode {
    match e {
        QueueError::UnknownDependency(_) | QueueError::DependencyCycle(_) => {
            warn!("rejected task change: {e}");
            StatusCode::UNPROCESSABLE_ENTITY
        }
        other => internal(other),
    }
}

fn dispatch_status(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::UnknownJob(_) => StatusCode::NOT_FOUND,
        DispatchError::AlreadyRunning(_) => StatusCode::CONFLICT,
        DispatchError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::MissingEnv { .. } => StatusCode::BAD_REQUEST,
    }
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct TasksQuery {
    pub issue: Option<u64>,
}

#[derive(Deserialize, Default)]
pub(crate) struct ClaimBody {
    pub agent: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CleanupBody {
    pub timeout_minutes: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PipelineBody {
    pub issue_number: u64,
    #[serde(default)]
    pub input: Value,
}

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    pub limit: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────────

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(health))
        // Tasks
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/stats", get(queue_stats))
        .route("/api/tasks/next", post(claim_next))
        .route("/api/tasks/cleanup", post(cleanup_tasks))
        .route("/api/tasks/:id", get(get_task).patch(update_task))
        .route("/api/tasks/:id/retry", post(retry_task))
        // Pipelines
        .route("/api/pipelines", post(create_pipeline))
        // Jobs and scripts
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/history", get(job_history))
        .route("/api/jobs/:name/run", post(run_job))
        .route("/api/scripts/:name/run", post(run_script))
        // Repository events
        .route("/api/webhooks/github", post(github_webhook))
        // SSE logs
        .route("/api/logs", get(sse_logs))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

// Tasks

pub(crate) async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TasksQuery>,
) -> Result<Json<Value>, StatusCode> {
    let tasks = match q.issue {
        Some(issue) => state.queue.get_tasks_by_issue(issue).await.map_err(queue_error)?,
        None => state.queue.load().await.map_err(queue_error)?.tasks,
    };
    Ok(Json(json!(tasks)))
}

pub(crate) async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewTask>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let task = state.queue.create_task(body).await.map_err(queue_error)?;
    Ok((StatusCode::CREATED, Json(json!(task))))
}

pub(crate) async fn queue_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let stats = state.queue.get_queue_stats().await.map_err(queue_error)?;
    Ok(Json(json!(stats)))
}

pub(crate) async fn claim_next(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ClaimBody>>,
) -> Result<Json<Value>, StatusCode> {
    let Json(body) = body.unwrap_or_default();
    let task = state
        .queue
        .claim_next_task(body.agent.as_deref())
        .await
        .map_err(queue_error)?;
    Ok(Json(json!({ "task": task })))
}

pub(crate) async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.queue.get_task(&id).await.map_err(queue_error)? {
        None => Err(StatusCode::NOT_FOUND),
        Some(task) => Ok(Json(json!(task))),
    }
}

pub(crate) async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Value>, StatusCode> {
    match state.queue.update_task(&id, patch).await.map_err(queue_error)? {
        None => Err(StatusCode::NOT_FOUND),
        Some(task) => Ok(Json(json!(task))),
    }
}

pub(crate) async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if state.queue.get_task(&id).await.map_err(queue_error)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    match state.queue.retry_task(&id).await.map_err(queue_error)? {
        // Not failed, or out of retries.
        None => Err(StatusCode::CONFLICT),
        Some(task) => Ok(Json(json!(task))),
    }
}

pub(crate) async fn cleanup_tasks(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CleanupBody>>,
) -> Result<Json<Value>, StatusCode> {
    let Json(body) = body.unwrap_or_default();
    let minutes = body.timeout_minutes.unwrap_or(state.stale_task_minutes);
    let cleaned = state
        .queue
        .cleanup_stale_tasks(minutes)
        .await
        .map_err(queue_error)?;
    Ok(Json(json!({ "cleaned": cleaned, "timeoutMinutes": minutes })))
}

// Pipelines

pub(crate) async fn create_pipeline(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PipelineBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let tasks = create_pipeline_tasks(&state.queue, body.issue_number, body.input)
        .await
        .map_err(queue_error)?;
    Ok((StatusCode::CREATED, Json(json!({ "tasks": tasks }))))
}

// Jobs

pub(crate) async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let running = state.dispatcher.running();
    let jobs: Vec<Value> = state
        .dispatcher
        .registry()
        .list()
        .into_iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "kind": spec.kind,
                "description": spec.description,
                "allowedEnv": spec.allowed_env,
                "requiredEnv": spec.required_env,
                "intervalSecs": spec.interval_secs,
                "running": running.contains(&spec.key()),
            })
        })
        .collect();
    Json(json!({ "jobs": jobs, "running": running }))
}

pub(crate) async fn job_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Json<Value> {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_PAGE);
    let executions = state.dispatcher.history().recent(limit).await;
    Json(json!({ "executions": executions }))
}

pub(crate) async fn run_job(
    state: State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<Invocation>>,
) -> Result<Json<DispatchOutcome>, (StatusCode, Json<Value>)> {
    dispatch(state, JobKind::Job, name, body).await
}

pub(crate) async fn run_script(
    state: State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<Invocation>>,
) -> Result<Json<DispatchOutcome>, (StatusCode, Json<Value>)> {
    dispatch(state, JobKind::Script, name, body).await
}

/// Runs on its own task: a client that disconnects stops waiting, the
/// process keeps running until it exits or times out.
async fn dispatch(
    State(state): State<Arc<AppState>>,
    kind: JobKind,
    name: String,
    body: Option<Json<Invocation>>,
) -> Result<Json<DispatchOutcome>, (StatusCode, Json<Value>)> {
    let Json(invocation) = body.unwrap_or_default();
    let dispatcher = state.dispatcher.clone();
    let handle = tokio::spawn(async move { dispatcher.run(kind, &name, invocation).await });

    match handle.await {
        Ok(Ok(outcome)) => Ok(Json(outcome)),
        Ok(Err(e)) => Err((dispatch_status(&e), Json(json!({ "error": e.to_string() })))),
        Err(e) => Err((internal(e), Json(json!({ "error": "job task failed" })))),
    }
}

// Repository events

pub(crate) async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let Some(event) = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let router = Arc::clone(&state.webhooks);
    let handle = tokio::spawn(async move { router.handle(&event, &payload).await });
    let response = handle.await.map_err(internal)?;
    Ok(Json(json!(response)))
}

// SSE logs

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting ring to avoid race
    let live_rx = state.logs.tx.subscribe();
    let history = state.logs.snapshot();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
