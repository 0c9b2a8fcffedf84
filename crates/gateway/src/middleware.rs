//! Request-path middleware. Order on the wire: CORS → body cap → audit →
//! rate limit → auth → handler. The rate limiter deliberately runs before
//! authentication so a denial never reveals whether a token would have
//! been accepted; audit wraps both so denied and unauthorized responses
//! are recorded too.

use crate::error::{AuditErrorTag, AuditProviderTag, GatewayError};
use crate::{epoch_ms, epoch_s, SharedState};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::net::SocketAddr;
use tollgate_auth::{is_public, Principal};
use tollgate_ratelimit::RouteClass;

/// CORS: wildcard origin, 204 preflight. Headers match what agent
/// clients actually send (JSON bodies + bearer tokens).
pub(crate) async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        headers.insert(
            "Access-Control-Allow-Origin",
            HeaderValue::from_static("*"),
        );
        headers.insert(
            "Access-Control-Allow-Methods",
            HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
        );
        headers.insert(
            "Access-Control-Allow-Headers",
            HeaderValue::from_static("Content-Type,Authorization"),
        );
        return response;
    }
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    response
}

/// Pre-auth client identity: the presented bearer token when there is
/// one (stable per client, no validation implied), else the peer
/// address.
fn rate_limit_key(req: &Request) -> String {
    if let Some(token) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return token.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

pub(crate) async fn rate_limit(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    let class = RouteClass::classify(req.uri().path());
    let key = rate_limit_key(&req);
    let decision = state.limiter.check(&key, class, epoch_ms());

    if !decision.allowed {
        let body = json!({
            "error": "rate_limited",
            "message": format!("{} quota exceeded", class.as_str()),
            "retry_after": decision.retry_after_s,
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert("Retry-After", header_num(decision.retry_after_s));
        headers.insert("X-RateLimit-Limit", header_num(decision.limit as u64));
        headers.insert("X-RateLimit-Remaining", header_num(0));
        headers.insert("X-RateLimit-Reset", header_num(decision.reset_unix_s));
        response
            .extensions_mut()
            .insert(AuditErrorTag("rate_limited"));
        return response;
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        "X-RateLimit-Remaining",
        header_num(decision.remaining as u64),
    );
    headers.insert("X-RateLimit-Reset", header_num(decision.reset_unix_s));
    response
}

fn header_num(n: u64) -> HeaderValue {
    HeaderValue::from_str(&n.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("0"))
}

pub(crate) async fn auth(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Response {
    if is_public(req.uri().path()) {
        return next.run(req).await;
    }
    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match state
        .verifier
        .verify_bearer(authorization.as_deref(), epoch_s())
    {
        Ok(principal) => {
            req.extensions_mut().insert(principal.clone());
            let mut response = next.run(req).await;
            // surfaced for the audit middleware a layer out
            response.extensions_mut().insert(principal);
            response
        }
        Err(e) => GatewayError::Unauthorized(e.to_string()).into_response(),
    }
}

/// One audit record per terminal response, provider identity and error
/// tag included when the inner layers attached them. Credential material
/// never enters the record: only the verified subject or peer address.
pub(crate) async fn audit(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let fallback_client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string());

    let response = next.run(req).await;

    let client = response
        .extensions()
        .get::<Principal>()
        .map(|p| p.sub.clone())
        .unwrap_or(fallback_client);
    let mut content = json!({
        "kind": "http_request",
        "method": method,
        "path": path,
        "status": response.status().as_u16(),
        "client": client,
    });
    if let Some(AuditProviderTag(provider)) = response.extensions().get::<AuditProviderTag>() {
        content["provider"] = json!(provider);
    }
    if let Some(AuditErrorTag(tag)) = response.extensions().get::<AuditErrorTag>() {
        content["error"] = json!(tag);
    }
    if let Err(e) = state.audit.append(content) {
        tracing::error!(error = %e, "failed to append audit record");
    }
    response
}

/// Body for unknown paths; also used as the router fallback.
pub(crate) async fn not_found(req: Request) -> Response {
    GatewayError::NotFound(format!("no route for {}", req.uri().path())).into_response()
}
