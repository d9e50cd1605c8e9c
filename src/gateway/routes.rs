use crate::error::{AppError, AppResult};
use crate::model::{CompleteAttempt, NewTask};
use crate::repository::TaskFilter;
use crate::GatewayState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

type St = State<Arc<GatewayState>>;

pub async fn health(State(state): St) -> Json<Value> {
    Json(json!({
        "ok": true,
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn queue_task(
    State(state): St,
    Json(input): Json<NewTask>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let task = state
        .repo
        .create_task(input, state.config.max_attempts as i64)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "task_id": task.id }))))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): St,
    Query(q): Query<ListTasksQuery>,
) -> AppResult<Json<Value>> {
    let tasks = state
        .repo
        .list_tasks(&TaskFilter { status: q.status })
        .await?;
    Ok(Json(json!({ "tasks": tasks })))
}

pub async fn get_task(State(state): St, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let task = state.repo.get_task(&id).await?;
    Ok(Json(serde_json::to_value(task).unwrap()))
}

pub async fn list_attempts(State(state): St, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let attempts = state.repo.list_attempts(&id).await?;
    Ok(Json(json!({ "attempts": attempts })))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_task_events(
    State(state): St,
    Path(id): Path<String>,
    Query(q): Query<ListEventsQuery>,
) -> AppResult<Json<Value>> {
    let events = state.repo.list_events(q.limit.unwrap_or(100), Some(&id)).await?;
    Ok(Json(json!({ "events": events })))
}

pub async fn list_events(
    State(state): St,
    Query(q): Query<ListEventsQueryGlobal>,
) -> AppResult<Json<Value>> {
    let events = state
        .repo
        .list_events(q.limit.unwrap_or(100), q.task_id.as_deref())
        .await?;
    Ok(Json(json!({ "events": events })))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQueryGlobal {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LeaseRequest {
    pub worker_id: String,
    #[serde(default)]
    pub lease_ttl_ms: Option<u64>,
}

fn require_positive_ttl(ttl: Option<u64>, default: u64) -> AppResult<u64> {
    match ttl {
        Some(0) => Err(AppError::Validation("lease_ttl_ms must be positive".into())),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

pub async fn lease_task(State(state): St, Json(req): Json<LeaseRequest>) -> AppResult<Json<Value>> {
    if req.worker_id.trim().is_empty() {
        return Err(AppError::Validation("worker_id is required".into()));
    }
    let ttl = require_positive_ttl(req.lease_ttl_ms, state.config.lease_ttl_ms)?;

    let Some(task) = state.repo.claim_next_task(&req.worker_id, ttl).await? else {
        return Ok(Json(json!({ "task": null })));
    };

    let Some(started) = state.repo.start_attempt(&task.id, &req.worker_id).await? else {
        return Ok(Json(json!({ "task": null })));
    };

    Ok(Json(json!({
        "task": task,
        "attempt_no": started.attempt_no,
        "attempt_id": started.attempt_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    #[serde(default)]
    pub lease_ttl_ms: Option<u64>,
}

pub async fn heartbeat(
    State(state): St,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> AppResult<Json<Value>> {
    let ttl = require_positive_ttl(req.lease_ttl_ms, state.config.lease_ttl_ms)?;
    let ok = state.repo.heartbeat(&id, &req.worker_id, ttl).await?;
    Ok(Json(json!({ "ok": ok })))
}

#[derive(Debug, Deserialize)]
pub struct PostEventRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub attempt_id: Option<i64>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

pub async fn post_event(
    State(state): St,
    Path(id): Path<String>,
    Json(req): Json<PostEventRequest>,
) -> AppResult<Json<Value>> {
    if req.worker_id.as_deref().unwrap_or("").trim().is_empty() {
        return Err(AppError::Validation("worker_id is required".into()));
    }
    if req.message.trim().is_empty() {
        return Err(AppError::Validation("message must not be empty".into()));
    }
    let level = req.level.unwrap_or_else(|| "info".to_string());
    let event_id = state
        .repo
        .append_event(
            Some(&id),
            req.attempt_id,
            req.phase.as_deref(),
            &level,
            &req.message,
            req.data.as_ref(),
        )
        .await?;
    Ok(Json(json!({ "ok": true, "event_id": event_id })))
}

pub async fn complete_task(
    State(state): St,
    Path(id): Path<String>,
    Json(req): Json<CompleteAttempt>,
) -> AppResult<Json<Value>> {
    if req.worker_id.trim().is_empty() {
        return Err(AppError::Validation("worker_id is required".into()));
    }
    match state.repo.complete_attempt(&id, req).await? {
        Some(status) => Ok(Json(json!({ "ok": true, "status": status }))),
        None => Ok(Json(json!({ "ok": false }))),
    }
}

pub async fn get_state(State(state): St, Path(key): Path<String>) -> AppResult<Json<Value>> {
    match state.repo.get_state(&key).await? {
        Some(row) => Ok(Json(json!({
            "key": row.key,
            "value": row.value(),
            "updated_at": row.updated_at,
        }))),
        None => Err(AppError::NotFound(format!("state key {key} not found"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetStateRequest {
    pub value: Value,
}

pub async fn set_state(
    State(state): St,
    Path(key): Path<String>,
    Json(req): Json<SetStateRequest>,
) -> AppResult<Json<Value>> {
    let row = state.repo.set_state(&key, &req.value).await?;
    Ok(Json(json!({
        "ok": true,
        "key": row.key,
        "value": row.value(),
        "updated_at": row.updated_at,
    })))
}
