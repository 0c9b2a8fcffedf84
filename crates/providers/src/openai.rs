//! OpenAI-shaped adapter: `/v1/chat/completions` with a bearer
//! credential. Also serves the OpenAI-compatible surfaces of together
//! and gemini — same wire shape, different base URL and key.

use crate::stream::{line_stream, send_with_connect_retry, sse_data};
use crate::{
    redact_excerpt, ChatDelta, ChatMessage, ChatRequest, DeltaStream, NormalizedMessage,
    NormalizedReply, ProviderAdapter, ProviderError, CHAT_TIMEOUT_SECS, PROBE_TIMEOUT_SECS,
};
use async_trait::async_trait;
use futures::future::ready;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    stream: bool,
}

impl OpenAiAdapter {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self, ProviderError> {
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
        match &self.api_key {
            Some(k) if !k.is_empty() => builder.bearer_auth(k),
            _ => builder,
        }
    }

    async fn post_chat(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = WireRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream,
        };
        let builder = self
            .authed(self.client.post(self.url("/v1/chat/completions")))
            .json(&body);
        let resp = send_with_connect_retry(builder).await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status,
                excerpt: redact_excerpt(&body, self.api_key.as_deref()),
            });
        }
        Ok(resp)
    }
}

fn normalize(model: &str, raw: &Value) -> Result<NormalizedReply, ProviderError> {
    let message = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c0| c0.get("message"))
        .ok_or_else(|| {
            ProviderError::InvalidResponse("missing choices[0].message".to_string())
        })?;
    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let role = message
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or("assistant")
        .to_string();
    let usage = raw.get("usage");
    Ok(NormalizedReply {
        model: model.to_string(),
        message: NormalizedMessage { role, content },
        prompt_eval_count: usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_u64()),
        eval_count: usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_u64()),
    })
}

fn delta_content(payload: &str) -> Option<String> {
    let v: Value = serde_json::from_str(payload).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<NormalizedReply, ProviderError> {
        let resp = self.post_chat(req, false).await?;
        let raw: Value = resp.json().await?;
        normalize(&req.model, &raw)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let resp = self.post_chat(req, true).await?;
        // Frames are `data: {json}`; the upstream terminator is
        // `data: [DONE]`, which ends the stream without being forwarded.
        let deltas = line_stream(resp.bytes_stream())
            .filter_map(|line| {
                ready(match line {
                    Ok(l) => sse_data(&l).map(Ok),
                    Err(e) => Some(Err(e)),
                })
            })
            .take_while(|item| ready(!matches!(item, Ok(p) if p == "[DONE]")))
            .filter_map(|item| {
                ready(match item {
                    Ok(payload) => delta_content(&payload).map(|content| Ok(ChatDelta { content })),
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
                excerpt: redact_excerpt(&body, self.api_key.as_deref()),
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
    use futures::StreamExt;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            stream: false,
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn chat_normalizes_reply() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/chat/completions"),
                request::headers(contains(("authorization", "Bearer sk-test"))),
            ])
            .respond_with(json_encoded(json!({
                "id": "chatcmpl-1",
                "choices": [{"message": {"role": "assistant", "content": "Hello world"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            }))),
        );

        let adapter =
            OpenAiAdapter::new(server.url_str(""), Some("sk-test".to_string())).unwrap();
        let reply = adapter.chat(&request()).await.unwrap();
        assert_eq!(reply.model, "gpt-4o");
        assert_eq!(reply.message.role, "assistant");
        assert_eq!(reply.message.content, "Hello world");
        assert_eq!(reply.prompt_eval_count, Some(12));
        assert_eq!(reply.eval_count, Some(3));
    }

    #[tokio::test]
    async fn upstream_error_excerpt_scrubs_the_echoed_credential() {
        // auth failures commonly quote the presented key back; that echo
        // must never reach the client
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(
                    status_code(401)
                        .body(r#"{"error":{"message":"Incorrect API key provided: sk-test"}}"#),
                ),
        );

        let adapter =
            OpenAiAdapter::new(server.url_str(""), Some("sk-test".to_string())).unwrap();
        let err = adapter.chat(&request()).await.unwrap_err();
        match err {
            ProviderError::Upstream { status, excerpt } => {
                assert_eq!(status, 401);
                assert!(excerpt.contains("Incorrect API key"));
                assert!(!excerpt.contains("sk-test"));
                assert!(excerpt.contains("[redacted]"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stream_yields_deltas_and_stops_at_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(status_code(200).body(body)),
        );

        let adapter = OpenAiAdapter::new(server.url_str(""), None).unwrap();
        let mut req = request();
        req.stream = true;
        let stream = adapter.chat_stream(&req).await.unwrap();
        let deltas: Vec<String> = stream
            .map(|d| d.unwrap().content)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(deltas, vec!["Hello", " ", "world"]);
    }

    #[tokio::test]
    async fn list_models_extracts_ids() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/models")).respond_with(
                json_encoded(json!({"data": [{"id": "gpt-4o"}, {"id": "o3-mini"}]})),
            ),
        );
        let adapter = OpenAiAdapter::new(server.url_str(""), None).unwrap();
        let models = adapter.list_models().await.unwrap();
        assert_eq!(models, vec!["gpt-4o", "o3-mini"]);
    }
}
