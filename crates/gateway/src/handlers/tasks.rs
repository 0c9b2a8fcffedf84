//! Task marketplace endpoints. The store enforces the state machine;
//! this layer only shapes requests, ids, and conflicts.

use crate::error::GatewayError;
use crate::SharedState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use tollgate_tasks::{NewTask, Priority, TaskFilter, TaskStatus};
use uuid::Uuid;

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub(crate) struct TaskQuery {
    status: Option<TaskStatus>,
    priority: Option<Priority>,
    agent: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClaimRequest {
    agent: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompleteRequest {
    agent: String,
    #[serde(default)]
    summary: Option<String>,
}

fn parse_id(raw: &str) -> Result<Uuid, GatewayError> {
    Uuid::parse_str(raw).map_err(|_| GatewayError::NotFound(format!("task {raw} not found")))
}

pub(crate) async fn list(
    State(state): State<SharedState>,
    query: Result<Query<TaskQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rej) => return GatewayError::Validation(vec![rej.to_string()]).into_response(),
    };
    let filter = TaskFilter {
        status: query.status,
        priority: query.priority,
        agent: query.agent,
    };
    let (tasks, total) = state.tasks.list(
        &filter,
        query.limit.unwrap_or(DEFAULT_LIMIT),
        query.offset.unwrap_or(0),
    );
    Json(json!({"tasks": tasks, "total": total})).into_response()
}

pub(crate) async fn create(
    State(state): State<SharedState>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> Response {
    let Json(new) = match body {
        Ok(b) => b,
        Err(rej) => return GatewayError::Validation(vec![rej.to_string()]).into_response(),
    };
    if new.title.trim().is_empty() {
        return GatewayError::Validation(vec!["title must be a non-empty string".to_string()])
            .into_response();
    }
    match state.tasks.create(new) {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

pub(crate) async fn claim(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Result<Json<ClaimRequest>, JsonRejection>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(rej) => return GatewayError::Validation(vec![rej.to_string()]).into_response(),
    };
    if body.agent.trim().is_empty() {
        return GatewayError::Validation(vec!["agent must be a non-empty string".to_string()])
            .into_response();
    }
    match state.tasks.claim(id, &body.agent) {
        Ok(task) => Json(task).into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

pub(crate) async fn complete(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(rej) => return GatewayError::Validation(vec![rej.to_string()]).into_response(),
    };
    if body.agent.trim().is_empty() {
        return GatewayError::Validation(vec!["agent must be a non-empty string".to_string()])
            .into_response();
    }
    match state.tasks.complete(id, &body.agent, body.summary) {
        Ok(task) => Json(task).into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}
