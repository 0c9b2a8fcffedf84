//! Instance metadata: health/readiness, the static schema, provider
//! model listings, and the advertised agent roster.

use crate::SharedState;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tollgate_providers::ProviderId;

pub(crate) async fn health(State(state): State<SharedState>) -> Response {
    let ids = state.bindings.ids();
    let probes = join_all(ids.iter().map(|id| {
        let binding = state.bindings.get(*id);
        async move {
            match binding {
                Some(b) => b.health().await,
                None => false,
            }
        }
    }))
    .await;

    let mut providers = Map::new();
    for (id, healthy) in ids.iter().zip(probes) {
        providers.insert(id.as_str().to_string(), json!(healthy));
    }
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "dev_mode": state.verifier.dev_mode(),
        "providers": providers,
    }))
    .into_response()
}

pub(crate) async fn ready() -> Response {
    Json(json!({"ready": true})).into_response()
}

pub(crate) async fn models(State(state): State<SharedState>) -> Response {
    let ids = state.bindings.ids();
    let listings = join_all(ids.iter().map(|id| {
        let binding = state.bindings.get(*id);
        async move {
            match binding {
                Some(b) => b.list_models().await,
                None => Ok(vec![]),
            }
        }
    }))
    .await;

    let mut providers = Map::new();
    for (id, listing) in ids.iter().zip(listings) {
        let models = match listing {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(provider = %id, error = %e, "model listing failed");
                vec![]
            }
        };
        providers.insert(id.as_str().to_string(), json!(models));
    }
    Json(json!({"providers": providers})).into_response()
}

fn flagship_model(id: ProviderId) -> Value {
    match id {
        ProviderId::Openai => json!("gpt-4o"),
        ProviderId::Anthropic => json!("claude-3-5-sonnet"),
        ProviderId::Gemini => json!("gemini-1.5-pro"),
        ProviderId::Together => json!("meta-llama/Llama-3.1-8B"),
        ProviderId::Ollama => json!("qwen2.5:3b"),
    }
}

/// Static roster: one advertised relay agent per bound provider. The
/// gateway owns no agent registry; this mirrors what is callable.
pub(crate) async fn agents(State(state): State<SharedState>) -> Response {
    let agents: Vec<Value> = state
        .bindings
        .ids()
        .into_iter()
        .map(|id| {
            json!({
                "id": format!("relay-{}", id.as_str()),
                "name": format!("{} relay", id.as_str()),
                "type": "provider",
                "status": "ready",
                "model": flagship_model(id),
            })
        })
        .collect();
    let count = agents.len();
    Json(json!({"agents": agents, "count": count})).into_response()
}

pub(crate) async fn openapi() -> Response {
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": "tollgate",
            "description": "Trust-boundary gateway mediating AI-provider access for untrusted agents.",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/health": {"get": {"summary": "Instance and provider availability"}},
            "/ready": {"get": {"summary": "Readiness probe"}},
            "/openapi.json": {"get": {"summary": "This document"}},
            "/v1/chat": {"post": {"summary": "Unified chat; set stream=true for server-sent events"}},
            "/v1/generate": {"post": {"summary": "Legacy prompt completion"}},
            "/v1/models": {"get": {"summary": "Per-provider model list"}},
            "/agents": {"get": {"summary": "Advertised agent roster"}},
            "/tasks": {
                "get": {"summary": "List tasks"},
                "post": {"summary": "Create a task"}
            },
            "/tasks/{id}/claim": {"post": {"summary": "Claim an available task"}},
            "/tasks/{id}/complete": {"post": {"summary": "Complete a claimed task"}},
            "/memory": {
                "get": {"summary": "List memory entries"},
                "post": {"summary": "Append a memory entry"}
            },
            "/memory/{key}": {
                "get": {"summary": "Newest entry for a key"},
                "delete": {"summary": "Redactively erase the newest entry for a key"}
            },
            "/memory/verify": {"get": {"summary": "Verify the memory chain"}}
        }
    }))
    .into_response()
}
