//! Anthropic adapter: `/v1/messages` with `x-api-key` + pinned
//! `anthropic-version`. System-role messages are lifted into the
//! top-level `system` field the API expects.

use crate::stream::{line_stream, send_with_connect_retry, sse_data};
use crate::{
    redact_excerpt, ChatDelta, ChatRequest, DeltaStream, NormalizedMessage, NormalizedReply,
    ProviderAdapter, ProviderError, CHAT_TIMEOUT_SECS, PROBE_TIMEOUT_SECS,
};
use async_trait::async_trait;
use futures::future::ready;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The messages API requires max_tokens; applied when the client omits it.
const DEFAULT_MAX_TOKENS: u64 = 1024;

pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

impl AnthropicAdapter {
    pub fn new(base_url: String, api_key: String) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    async fn post_messages(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        // System turns move out of the message list into `system`.
        let system: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let body = WireRequest {
            model: &req.model,
            messages: req
                .messages
                .iter()
                .filter(|m| m.role != "system")
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n"))
            },
            temperature: req.temperature,
            stream,
        };
        let builder = self
            .authed(self.client.post(self.url("/v1/messages")))
            .json(&body);
        let resp = send_with_connect_retry(builder).await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status,
                excerpt: redact_excerpt(&body, Some(&self.api_key)),
            });
        }
        Ok(resp)
    }
}

fn normalize(model: &str, raw: &Value) -> Result<NormalizedReply, ProviderError> {
    let content = raw
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        })
        .and_then(|b| b.get("text"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProviderError::InvalidResponse("missing content[type=text].text".to_string()))?
        .to_string();
    let usage = raw.get("usage");
    Ok(NormalizedReply {
        model: model.to_string(),
        message: NormalizedMessage {
            role: "assistant".to_string(),
            content,
        },
        prompt_eval_count: usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(|v| v.as_u64()),
        eval_count: usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64()),
    })
}

/// Only `content_block_delta` events carry forwardable text.
fn delta_content(payload: &str) -> Option<String> {
    let v: Value = serde_json::from_str(payload).ok()?;
    if v.get("type").and_then(|t| t.as_str()) != Some("content_block_delta") {
        return None;
    }
    v.get("delta")?
        .get("text")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<NormalizedReply, ProviderError> {
        let resp = self.post_messages(req, false).await?;
        let raw: Value = resp.json().await?;
        normalize(&req.model, &raw)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let resp = self.post_messages(req, true).await?;
        let deltas = line_stream(resp.bytes_stream()).filter_map(|line| {
            ready(match line {
                Ok(l) => sse_data(&l)
                    .and_then(|payload| delta_content(&payload))
                    .map(|content| Ok(ChatDelta { content })),
                Err(e) => Some(Err(e)),
            })
        });
        Ok(Box::pin(deltas))
    }

    async fn health(&self) -> bool {
        let builder = self
            .authed(self.client.get(self.url("/v1/models")))
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS));
        match builder.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let builder = self
            .authed(self.client.get(self.url("/v1/models")))
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS));
        let resp = send_with_connect_retry(builder).await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status,
                excerpt: redact_excerpt(&body, Some(&self.api_key)),
            });
        }
        let raw: Value = resp.json().await?;
        let models = raw
            .get("data")
            .and_then(|d| d.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;
    use futures::StreamExt;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "claude-3-5-sonnet".to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "be terse".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                },
            ],
            stream: false,
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn chat_lifts_system_and_normalizes() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/messages"),
                request::headers(contains(("x-api-key", "sk-ant-test"))),
                request::headers(contains(("anthropic-version", "2023-06-01"))),
                request::body(json_decoded(eq(json!({
                    "model": "claude-3-5-sonnet",
                    "messages": [{"role": "user", "content": "hi"}],
                    "max_tokens": 1024,
                    "system": "be terse",
                    "stream": false
                })))),
            ])
            .respond_with(json_encoded(json!({
                "content": [{"type": "text", "text": "Hello there"}],
                "usage": {"input_tokens": 9, "output_tokens": 2}
            }))),
        );

        let adapter =
            AnthropicAdapter::new(server.url_str(""), "sk-ant-test".to_string()).unwrap();
        let reply = adapter.chat(&request()).await.unwrap();
        assert_eq!(reply.message.role, "assistant");
        assert_eq!(reply.message.content, "Hello there");
        assert_eq!(reply.prompt_eval_count, Some(9));
        assert_eq!(reply.eval_count, Some(2));
    }

    #[tokio::test]
    async fn stream_forwards_only_content_block_deltas() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/messages"))
                .respond_with(status_code(200).body(body)),
        );

        let adapter =
            AnthropicAdapter::new(server.url_str(""), "sk-ant-test".to_string()).unwrap();
        let mut req = request();
        req.stream = true;
        let stream = adapter.chat_stream(&req).await.unwrap();
        let deltas: Vec<String> = stream
            .map(|d| d.unwrap().content)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(deltas, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn upstream_4xx_is_a_provider_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/messages"))
                .respond_with(status_code(429).body("rate limited upstream")),
        );
        let adapter =
            AnthropicAdapter::new(server.url_str(""), "sk-ant-test".to_string()).unwrap();
        let err = adapter.chat(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Upstream { status: 429, .. }));
    }
}
