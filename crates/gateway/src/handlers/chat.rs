//! /v1/chat and the legacy /v1/generate surface. Provider selection,
//! unary proxying, and the SSE re-framing of upstream delta streams.

use crate::error::{AuditProviderTag, GatewayError};
use crate::SharedState;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures::future::ready;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tollgate_providers::{pick_provider, ChatMessage, ChatRequest, DeltaStream};

fn tag_provider(mut response: Response, provider: &str) -> Response {
    response
        .extensions_mut()
        .insert(AuditProviderTag(provider.to_string()));
    response
}

fn parse_body<T: serde::de::DeserializeOwned>(
    body: Result<Json<Value>, JsonRejection>,
) -> Result<T, GatewayError> {
    let Json(value) = body.map_err(|rej| GatewayError::Validation(vec![rej.to_string()]))?;
    serde_json::from_value(value).map_err(|e| GatewayError::Validation(vec![e.to_string()]))
}

pub(crate) async fn chat(
    State(state): State<SharedState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let request: ChatRequest = match parse_body(body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    if let Err(errors) = request.validate() {
        return GatewayError::Validation(errors).into_response();
    }

    let provider = pick_provider(&request.model);
    let binding = match state.bindings.get(provider) {
        Some(b) => b,
        None => {
            return tag_provider(
                GatewayError::ProviderUnavailable(provider.to_string()).into_response(),
                provider.as_str(),
            )
        }
    };

    if request.stream {
        match binding.chat_stream(&request).await {
            Ok(deltas) => {
                let response = (
                    [
                        (CONTENT_TYPE.as_str(), "text/event-stream"),
                        ("Cache-Control", "no-cache"),
                        // tell intermediate proxies not to buffer frames
                        ("X-Accel-Buffering", "no"),
                    ],
                    Body::from_stream(sse_frames(deltas)),
                )
                    .into_response();
                tag_provider(response, provider.as_str())
            }
            Err(e) => tag_provider(
                GatewayError::from(e).into_response(),
                provider.as_str(),
            ),
        }
    } else {
        match binding.chat(&request).await {
            Ok(reply) => tag_provider(Json(reply).into_response(), provider.as_str()),
            Err(e) => tag_provider(
                GatewayError::from(e).into_response(),
                provider.as_str(),
            ),
        }
    }
}

/// Re-frame upstream deltas as server-sent events. Frames are forwarded
/// strictly in arrival order; an upstream failure mid-stream emits one
/// error frame and terminates — the status line is already on the wire
/// by then. The terminal frame is always `data: [DONE]`.
fn sse_frames(deltas: DeltaStream) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    deltas
        .scan(false, |errored, item| {
            if *errored {
                return ready(None);
            }
            let payload = match item {
                Ok(delta) => json!({"message": {"content": delta.content}}),
                Err(e) => {
                    *errored = true;
                    tracing::warn!(error = %e, "upstream stream aborted");
                    json!({"error": "provider_error"})
                }
            };
            ready(Some(Bytes::from(format!("data: {payload}\n\n"))))
        })
        .chain(stream::once(ready(Bytes::from_static(
            b"data: [DONE]\n\n",
        ))))
        .map(Ok)
}

/// Legacy prompt-completion endpoint, ollama-shaped:
/// `{model, prompt}` in, `{model, response, done}` out.
#[derive(Debug, Deserialize)]
pub(crate) struct GenerateRequest {
    model: String,
    prompt: String,
}

pub(crate) async fn generate(
    State(state): State<SharedState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let request: GenerateRequest = match parse_body(body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    let chat_request = ChatRequest {
        model: request.model.clone(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: request.prompt,
        }],
        stream: false,
        temperature: None,
        max_tokens: None,
    };
    if let Err(errors) = chat_request.validate() {
        return GatewayError::Validation(errors).into_response();
    }

    let provider = pick_provider(&chat_request.model);
    let binding = match state.bindings.get(provider) {
        Some(b) => b,
        None => {
            return tag_provider(
                GatewayError::ProviderUnavailable(provider.to_string()).into_response(),
                provider.as_str(),
            )
        }
    };
    match binding.chat(&chat_request).await {
        Ok(reply) => tag_provider(
            Json(json!({
                "model": reply.model,
                "response": reply.message.content,
                "done": true,
            }))
            .into_response(),
            provider.as_str(),
        ),
        Err(e) => tag_provider(
            GatewayError::from(e).into_response(),
            provider.as_str(),
        ),
    }
}
