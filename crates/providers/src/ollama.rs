//! Ollama adapter: `/api/chat` on the configured local base URL, no
//! credential. Ollama replies already carry the normalized shape
//! (`message`, `prompt_eval_count`, `eval_count`); streaming is JSON
//! lines with a `done` terminator rather than SSE.

use crate::stream::{line_stream, send_with_connect_retry};
use crate::{
    redact_excerpt, ChatDelta, ChatMessage, ChatRequest, DeltaStream, NormalizedReply,
    ProviderAdapter, ProviderError, CHAT_TIMEOUT_SECS, PROBE_TIMEOUT_SECS,
};
use async_trait::async_trait;
use futures::future::ready;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

pub struct OllamaAdapter {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

impl OllamaAdapter {
    pub fn new(base_url: String) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_chat(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let options = match (req.temperature, req.max_tokens) {
            (None, None) => None,
            (temperature, num_predict) => Some(WireOptions {
                temperature,
                num_predict,
            }),
        };
        let body = WireRequest {
            model: &req.model,
            messages: &req.messages,
            stream,
            options,
        };
        let builder = self.client.post(self.url("/api/chat")).json(&body);
        let resp = send_with_connect_retry(builder).await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status,
                excerpt: redact_excerpt(&body, None),
            });
        }
        Ok(resp)
    }
}

fn delta_content(line: &str) -> Option<(String, bool)> {
    let v: Value = serde_json::from_str(line).ok()?;
    let done = v.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
    let content = v
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    Some((content, done))
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<NormalizedReply, ProviderError> {
        let resp = self.post_chat(req, false).await?;
        // Already the normalized shape; pass through.
        Ok(resp.json::<NormalizedReply>().await?)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let resp = self.post_chat(req, true).await?;
        let deltas = line_stream(resp.bytes_stream())
            .take_while(|item| {
                ready(!matches!(
                    item,
                    Ok(line) if delta_content(line).is_some_and(|(_, done)| done)
                ))
            })
            .filter_map(|item| {
                ready(match item {
                    Ok(line) => delta_content(&line)
                        .map(|(content, _)| content)
                        .filter(|c| !c.is_empty())
                        .map(|content| Ok(ChatDelta { content })),
                    Err(e) => Some(Err(e)),
                })
            });
        Ok(Box::pin(deltas))
    }

    async fn health(&self) -> bool {
        let builder = self
            .client
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS));
        match builder.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let builder = self
            .client
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS));
        let resp = send_with_connect_retry(builder).await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status,
                excerpt: redact_excerpt(&body, None),
            });
        }
        let raw: Value = resp.json().await?;
        let models = raw
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("name").and_then(|v| v.as_str()))
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
            model: "qwen2.5:3b".to_string(),
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
    async fn chat_passes_native_shape_through() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/chat")).respond_with(
                json_encoded(json!({
                    "model": "qwen2.5:3b",
                    "message": {"role": "assistant", "content": "hey"},
                    "prompt_eval_count": 4,
                    "eval_count": 1,
                    "done": true
                })),
            ),
        );
        let adapter = OllamaAdapter::new(server.url_str("")).unwrap();
        let reply = adapter.chat(&request()).await.unwrap();
        assert_eq!(reply.model, "qwen2.5:3b");
        assert_eq!(reply.message.content, "hey");
        assert_eq!(reply.prompt_eval_count, Some(4));
    }

    #[tokio::test]
    async fn stream_is_json_lines_until_done() {
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\" \"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"world\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/chat"))
                .respond_with(status_code(200).body(body)),
        );
        let adapter = OllamaAdapter::new(server.url_str("")).unwrap();
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
    async fn list_models_reads_tags() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/api/tags")).respond_with(
                json_encoded(json!({"models": [{"name": "qwen2.5:3b"}, {"name": "llama3.2:1b"}]})),
            ),
        );
        let adapter = OllamaAdapter::new(server.url_str("")).unwrap();
        let models = adapter.list_models().await.unwrap();
        assert_eq!(models, vec!["qwen2.5:3b", "llama3.2:1b"]);
    }

    #[tokio::test]
    async fn connection_refused_is_http_error() {
        // unroutable local port
        let adapter = OllamaAdapter::new("http://127.0.0.1:1".to_string()).unwrap();
        let err = adapter.chat(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Http(_)));
        assert_eq!(err.tag(), "connect");
    }
}
