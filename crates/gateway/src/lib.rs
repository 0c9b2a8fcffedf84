//! tollgate_gateway
//!
//! The request dispatcher: routes the HTTP surface, shapes errors, and
//! strings the pipeline together (CORS → body cap → audit → rate limit →
//! auth → handler). Collaborators — verifier, limiter, bindings, task
//! store, chains — are injected through `GatewayState`; nothing in here
//! is process-global, so tests and multi-instance embedders build as
//! many gateways as they like.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tollgate_chain::Chain;
use tollgate_providers::BindingTable;
use tollgate_ratelimit::RateLimiter;
use tollgate_tasks::TaskStore;
use tower_http::trace::TraceLayer;

pub mod error;
mod handlers;
mod middleware;

pub use error::GatewayError;

/// Incoming body cap. Chat payloads are small; anything bigger is abuse.
pub const BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Everything a request handler can reach. Built once at startup, shared
/// via `Arc`, immutable in structure (interior mutability lives inside
/// the members that need it).
pub struct GatewayState {
    pub verifier: tollgate_auth::TokenVerifier,
    pub limiter: RateLimiter,
    pub bindings: BindingTable,
    pub tasks: TaskStore,
    pub audit: Arc<Chain>,
    pub memory: Arc<Chain>,
}

pub type SharedState = Arc<GatewayState>;

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn epoch_s() -> u64 {
    epoch_ms() / 1000
}

/// Build the full router. Layer order matters: the last `.layer()` call
/// is outermost, so requests traverse trace → CORS → body cap → audit →
/// rate limit → auth before reaching a handler.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handlers::meta::health))
        .route("/ready", get(handlers::meta::ready))
        .route("/openapi.json", get(handlers::meta::openapi))
        .route("/v1/chat", post(handlers::chat::chat))
        .route("/v1/generate", post(handlers::chat::generate))
        .route("/v1/models", get(handlers::meta::models))
        .route("/agents", get(handlers::meta::agents))
        .route(
            "/tasks",
            get(handlers::tasks::list).post(handlers::tasks::create),
        )
        .route("/tasks/{id}/claim", post(handlers::tasks::claim))
        .route("/tasks/{id}/complete", post(handlers::tasks::complete))
        .route(
            "/memory",
            get(handlers::memory::list).post(handlers::memory::append),
        )
        .route("/memory/verify", get(handlers::memory::verify))
        .route(
            "/memory/{key}",
            get(handlers::memory::get_key).delete(handlers::memory::erase_key),
        )
        .fallback(middleware::not_found)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::audit,
        ))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(axum::middleware::from_fn(middleware::cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
