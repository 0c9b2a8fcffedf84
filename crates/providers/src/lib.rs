//! tollgate_providers
//!
//! Provider selection, transport, and normalization ONLY.
//! No auth. No rate limiting. No audit. The one retry we perform is a
//! single re-attempt on immediate TCP connect failure.
//!
//! Credentials live inside the bindings built at startup and are injected
//! into upstream requests here; they must never appear in errors,
//! normalized replies, or stream frames.

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

mod anthropic;
mod ollama;
mod openai;
mod stream;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/// End-to-end deadline for chat calls.
pub const CHAT_TIMEOUT_SECS: u64 = 120;
/// Deadline for health probes and model listings.
pub const PROBE_TIMEOUT_SECS: u64 = 3;
/// Concurrent upstream connections per provider binding.
pub const MAX_INFLIGHT_PER_PROVIDER: usize = 32;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {excerpt}")]
    Upstream { status: u16, excerpt: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether the failure was the end-to-end deadline expiring (maps to
    /// 504 at the gateway, everything else here is a 502).
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Http(e) if e.is_timeout())
    }

    /// Short tag for audit records.
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderError::Http(e) if e.is_timeout() => "timeout",
            ProviderError::Http(e) if e.is_connect() => "connect",
            ProviderError::Http(_) => "network",
            ProviderError::Upstream { .. } => "upstream_status",
            ProviderError::InvalidResponse(_) => "bad_response",
        }
    }
}

// ----------------------------
// Request envelope
// ----------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system"|"user"|"assistant"
    pub content: String,
}

/// The shared request envelope accepted on /v1/chat, provider-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

impl ChatRequest {
    /// Schema validation. Returns every violation, not just the first,
    /// so the client sees the full `errors[]` list.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.model.trim().is_empty() {
            errors.push("model must be a non-empty string".to_string());
        }
        if self.messages.is_empty() {
            errors.push("messages must be non-empty".to_string());
        }
        for (i, msg) in self.messages.iter().enumerate() {
            if msg.role.trim().is_empty() {
                errors.push(format!("messages[{i}].role must be non-empty"));
            }
            if msg.content.is_empty() {
                errors.push(format!("messages[{i}].content must be non-empty"));
            }
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                errors.push(format!("temperature must be within [0, 2], got {t}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ----------------------------
// Normalized response
// ----------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub role: String,
    pub content: String,
}

/// Every provider's unary reply is reshaped into this (ollama already
/// answers in it natively).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedReply {
    pub model: String,
    pub message: NormalizedMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
}

/// One streamed content fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDelta {
    pub content: String,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ChatDelta, ProviderError>> + Send>>;

// ----------------------------
// Provider selection
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Anthropic,
    Openai,
    Gemini,
    Together,
    Ollama,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::Openai => "openai",
            ProviderId::Gemini => "gemini",
            ProviderId::Together => "together",
            ProviderId::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a model string to its provider. Ordered rules, first match wins,
/// total over all non-empty inputs: anything unrecognized lands on the
/// local provider.
pub fn pick_provider(model: &str) -> ProviderId {
    if model.starts_with("claude") {
        ProviderId::Anthropic
    } else if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("o3") {
        ProviderId::Openai
    } else if model.starts_with("gemini") {
        ProviderId::Gemini
    } else if model.contains('/') {
        ProviderId::Together
    } else {
        ProviderId::Ollama
    }
}

// ----------------------------
// Adapter contract + bindings
// ----------------------------

/// Per-upstream request shaping and response normalization. Adapters are
/// transport only; policy stays in the gateway.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<NormalizedReply, ProviderError>;
    async fn chat_stream(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError>;
    /// Cheap liveness probe.
    async fn health(&self) -> bool;
    /// Models the upstream advertises. Degrades to an error the caller
    /// may treat as an empty list.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
}

/// Immutable runtime association of a provider identity with its adapter
/// (which holds base URL + credential). Caps in-flight upstream
/// connections with a semaphore; permits are held for the lifetime of a
/// stream, not just its setup.
pub struct ProviderBinding {
    pub id: ProviderId,
    adapter: Box<dyn ProviderAdapter>,
    permits: Arc<Semaphore>,
}

impl ProviderBinding {
    pub fn new(id: ProviderId, adapter: Box<dyn ProviderAdapter>) -> Self {
        Self {
            id,
            adapter,
            permits: Arc::new(Semaphore::new(MAX_INFLIGHT_PER_PROVIDER)),
        }
    }

    pub async fn chat(&self, req: &ChatRequest) -> Result<NormalizedReply, ProviderError> {
        let _permit = self.acquire().await?;
        self.adapter.chat(req).await
    }

    pub async fn chat_stream(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let permit = self.acquire().await?;
        let inner = self.adapter.chat_stream(req).await?;
        // Keep the permit alive until the caller drops the stream.
        Ok(Box::pin(stream::hold_permit(inner, permit)))
    }

    pub async fn health(&self) -> bool {
        self.adapter.health().await
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        self.adapter.list_models().await
    }

    async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit, ProviderError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::InvalidResponse("provider shutting down".to_string()))
    }
}

/// The provider-binding table, created at startup and immutable after.
#[derive(Default)]
pub struct BindingTable {
    bindings: HashMap<ProviderId, Arc<ProviderBinding>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, binding: ProviderBinding) {
        self.bindings.insert(binding.id, Arc::new(binding));
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<ProviderBinding>> {
        self.bindings.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.bindings.keys().copied().collect();
        ids.sort_by_key(|id| id.as_str());
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Truncated, credential-free excerpt of an upstream error body. Some
/// upstreams echo the presented key back in auth failures, so the
/// binding's credential is scrubbed before anything leaves this crate.
pub(crate) fn redact_excerpt(body: &str, credential: Option<&str>) -> String {
    let scrubbed = match credential {
        Some(secret) if !secret.is_empty() => body.replace(secret, "[redacted]"),
        _ => body.to_string(),
    };
    if scrubbed.chars().count() <= 200 {
        return scrubbed;
    }
    let mut excerpt: String = scrubbed.chars().take(200).collect();
    excerpt.push('…');
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_routes_known_prefixes() {
        assert_eq!(pick_provider("gpt-4o"), ProviderId::Openai);
        assert_eq!(pick_provider("o1-preview"), ProviderId::Openai);
        assert_eq!(pick_provider("o3-mini"), ProviderId::Openai);
        assert_eq!(pick_provider("claude-3-5-sonnet"), ProviderId::Anthropic);
        assert_eq!(pick_provider("gemini-1.5"), ProviderId::Gemini);
        assert_eq!(
            pick_provider("meta-llama/Llama-3.1-8B"),
            ProviderId::Together
        );
        assert_eq!(pick_provider("qwen2.5:3b"), ProviderId::Ollama);
    }

    #[test]
    fn selector_is_total_and_idempotent() {
        for model in ["", "x", "weird model", "claude", "gpt", "a/b/c", "🦀"] {
            let first = pick_provider(model);
            assert_eq!(first, pick_provider(model));
        }
    }

    fn valid_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            stream: false,
            temperature: Some(0.7),
            max_tokens: Some(256),
        }
    }

    #[test]
    fn validation_accepts_well_formed() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn validation_collects_all_errors() {
        let req = ChatRequest {
            model: "  ".to_string(),
            messages: vec![],
            stream: false,
            temperature: Some(3.0),
            max_tokens: None,
        };
        let errors = req.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("model")));
        assert!(errors.iter().any(|e| e.contains("messages")));
        assert!(errors.iter().any(|e| e.contains("temperature")));
    }

    #[test]
    fn validation_checks_message_fields() {
        let mut req = valid_request();
        req.messages.push(ChatMessage {
            role: String::new(),
            content: String::new(),
        });
        let errors = req.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("messages[1].role")));
        assert!(errors.iter().any(|e| e.contains("messages[1].content")));
    }

    #[test]
    fn temperature_bounds_are_inclusive() {
        let mut req = valid_request();
        req.temperature = Some(0.0);
        assert!(req.validate().is_ok());
        req.temperature = Some(2.0);
        assert!(req.validate().is_ok());
        req.temperature = Some(-0.1);
        assert!(req.validate().is_err());
    }

    #[test]
    fn excerpt_is_bounded() {
        let long = "x".repeat(5000);
        assert!(redact_excerpt(&long, None).chars().count() <= 201);
        assert_eq!(redact_excerpt("short", None), "short");
    }

    #[test]
    fn excerpt_scrubs_the_credential() {
        let leaky = r#"{"error":"Incorrect API key provided: sk-live-123"}"#;
        let scrubbed = redact_excerpt(leaky, Some("sk-live-123"));
        assert!(!scrubbed.contains("sk-live-123"));
        assert!(scrubbed.contains("[redacted]"));

        // scrubbing happens before truncation, so a key sitting past the
        // cut still never survives
        let long_leak = format!("{}sk-live-123", "x".repeat(195));
        let scrubbed = redact_excerpt(&long_leak, Some("sk-live-123"));
        assert!(!scrubbed.contains("sk-live-123"));

        // empty credential never blanks the whole body
        assert_eq!(redact_excerpt("plain error", Some("")), "plain error");
    }
}
