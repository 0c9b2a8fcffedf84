//! The wire error taxonomy. Every failure surface renders the same
//! stable JSON shape: `{"error": <kind>, "message"?: .., "errors"?: [..],
//! "retry_after"?: ..}`. The audit middleware reads the kind back out of
//! the response extensions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use tollgate_providers::ProviderError;
use tollgate_tasks::TaskError;

/// Error kind tag attached to responses so the audit record can name the
/// failure without parsing the body.
#[derive(Debug, Clone)]
pub struct AuditErrorTag(pub &'static str);

/// Provider identity attached to responses by the chat handlers.
#[derive(Debug, Clone)]
pub struct AuditProviderTag(pub String);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed")]
    Validation(Vec<String>),
    #[error("{0}")]
    Unauthorized(String),
    #[error("insufficient role")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("no provider bound for {0}")]
    ProviderUnavailable(String),
    #[error("upstream failure: {0}")]
    Provider(ProviderError),
    #[error("deadline exceeded")]
    Timeout,
    #[error("internal error")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::ProviderUnavailable(_) => "provider_unavailable",
            GatewayError::Provider(_) => "provider_error",
            GatewayError::Timeout => "timeout",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::ProviderUnavailable(_) | GatewayError::Provider(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(e: ProviderError) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Provider(e)
        }
    }
}

impl From<TaskError> for GatewayError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::NotFound(id) => GatewayError::NotFound(format!("task {id} not found")),
            TaskError::NotAvailable { .. } => GatewayError::Conflict("not_available".to_string()),
            TaskError::NotCompletable { .. } => {
                GatewayError::Conflict("not_completable".to_string())
            }
            TaskError::Lineage(e) => GatewayError::Internal(e.to_string()),
        }
    }
}

impl From<tollgate_chain::ChainError> for GatewayError {
    fn from(e: tollgate_chain::ChainError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let body = match &self {
            GatewayError::Validation(errors) => json!({
                "error": kind,
                "errors": errors,
            }),
            GatewayError::Internal(detail) => {
                // Full detail goes to the log/audit side, not the wire.
                tracing::error!(detail = %detail, "internal error");
                json!({"error": kind})
            }
            other => json!({
                "error": kind,
                "message": other.to_string(),
            }),
        };
        let mut response = (self.status(), Json(body)).into_response();
        response.extensions_mut().insert(AuditErrorTag(kind));
        response
    }
}
