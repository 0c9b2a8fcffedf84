//! The content-addressed memory chain surface. Entries are chain records
//! whose content carries `{key, value, type, truth_state}`; reads of
//! erased entries surface the redaction marker with `truth_state = -1`.

use crate::error::GatewayError;
use crate::SharedState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tollgate_chain::{ChainRecord, ListFilter};

const MEMORY_TYPES: &[&str] = &["fact", "observation", "inference", "commitment"];
const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub(crate) struct MemoryQuery {
    key: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    include_erased: bool,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MemoryAppend {
    key: String,
    value: Value,
    #[serde(rename = "type")]
    kind: Option<String>,
    truth_state: Option<i64>,
}

/// Chain record → wire entry. Erased records carry only the marker, so
/// the negative truth state is surfaced alongside it.
fn render(record: &ChainRecord) -> Value {
    let mut entry = json!({
        "hash": record.hash,
        "prev_hash": record.prev_hash,
        "timestamp_ns": record.timestamp_ns,
        "erased": record.erased,
        "content": record.content,
    });
    if record.erased {
        entry["truth_state"] = json!(-1);
    }
    entry
}

pub(crate) async fn list(
    State(state): State<SharedState>,
    query: Result<Query<MemoryQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rej) => return GatewayError::Validation(vec![rej.to_string()]).into_response(),
    };
    let mut filter = ListFilter::default();
    if let Some(key) = query.key {
        filter = filter.field("key", key);
    }
    if let Some(kind) = query.kind {
        filter = filter.field("type", kind);
    }
    if query.include_erased {
        filter = filter.with_erased();
    }
    let (records, total) = state.memory.list(
        &filter,
        query.limit.unwrap_or(DEFAULT_LIMIT),
        query.offset.unwrap_or(0),
    );
    let entries: Vec<Value> = records.iter().map(render).collect();
    Json(json!({"entries": entries, "total": total})).into_response()
}

pub(crate) async fn append(
    State(state): State<SharedState>,
    body: Result<Json<MemoryAppend>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rej) => return GatewayError::Validation(vec![rej.to_string()]).into_response(),
    };

    let mut errors = Vec::new();
    if body.key.trim().is_empty() {
        errors.push("key must be a non-empty string".to_string());
    }
    let kind = body.kind.unwrap_or_else(|| "fact".to_string());
    if !MEMORY_TYPES.contains(&kind.as_str()) {
        errors.push(format!(
            "type must be one of {MEMORY_TYPES:?}, got {kind:?}"
        ));
    }
    let truth_state = body.truth_state.unwrap_or(1);
    if !(-1..=1).contains(&truth_state) {
        errors.push(format!("truth_state must be -1, 0, or 1, got {truth_state}"));
    }
    if !errors.is_empty() {
        return GatewayError::Validation(errors).into_response();
    }

    match state.memory.append(json!({
        "key": body.key,
        "value": body.value,
        "type": kind,
        "truth_state": truth_state,
    })) {
        Ok(record) => (StatusCode::CREATED, Json(render(&record))).into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

pub(crate) async fn get_key(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Response {
    match state.memory.find_latest("key", &json!(key)) {
        Some(record) => Json(render(&record)).into_response(),
        None => GatewayError::NotFound(format!("no memory entry for key {key:?}")).into_response(),
    }
}

pub(crate) async fn erase_key(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Response {
    let record = match state.memory.find_latest("key", &json!(key)) {
        Some(r) => r,
        None => {
            return GatewayError::NotFound(format!("no memory entry for key {key:?}"))
                .into_response()
        }
    };
    match state.memory.erase(&record.hash) {
        Ok(true) => Json(json!({"erased": true, "hash": record.hash, "key": key})).into_response(),
        Ok(false) => {
            GatewayError::NotFound(format!("no memory entry for key {key:?}")).into_response()
        }
        Err(e) => GatewayError::from(e).into_response(),
    }
}

pub(crate) async fn verify(State(state): State<SharedState>) -> Response {
    Json(state.memory.verify()).into_response()
}
