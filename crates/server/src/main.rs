//! tollgate — trust-boundary gateway binary.
//!
//! Configuration is environment-first (every flag doubles as an env
//! var); a `.env` in the working directory is honored for local runs.
//! Providers bind only when their credential is present; ollama binds
//! unconditionally against OLLAMA_URL. Exit code 0 on graceful shutdown,
//! 1 on listener or configuration failure.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tollgate_auth::TokenVerifier;
use tollgate_chain::{Chain, ChainError};
use tollgate_gateway::{build_router, GatewayState};
use tollgate_providers::{
    AnthropicAdapter, BindingTable, OllamaAdapter, OpenAiAdapter, ProviderBinding, ProviderError,
    ProviderId,
};
use tollgate_ratelimit::{LimitConfig, RateLimiter};
use tollgate_tasks::TaskStore;
use tracing::{info, warn};

/// Audit records retained in memory when no journal is configured.
const AUDIT_BUFFER_CAP: usize = 1000;

#[derive(Debug, Error)]
enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("provider setup error: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Parser)]
#[command(name = "tollgate", version, about = "Trust-boundary AI gateway")]
struct Args {
    /// Listen address.
    #[arg(long, env = "GATEWAY_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Listen port.
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 4010)]
    port: u16,

    /// HMAC secret for agent bearer tokens. Absent = development mode.
    #[arg(long, env = "GATEWAY_AUTH_SECRET", hide_env_values = true)]
    auth_secret: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com")]
    openai_base_url: String,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    #[arg(long, env = "ANTHROPIC_BASE_URL", default_value = "https://api.anthropic.com")]
    anthropic_base_url: String,

    #[arg(long, env = "TOGETHER_API_KEY", hide_env_values = true)]
    together_api_key: Option<String>,

    #[arg(long, env = "TOGETHER_BASE_URL", default_value = "https://api.together.xyz")]
    together_base_url: String,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    /// Gemini's OpenAI-compatible surface.
    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com/v1beta/openai"
    )]
    gemini_base_url: String,

    /// Local inference endpoint; always bound.
    #[arg(long, env = "OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    ollama_url: String,

    /// Memory chain journal path (JSONL). Absent = in-memory only.
    #[arg(long, env = "MEMORY_JOURNAL")]
    memory_journal: Option<PathBuf>,

    /// Audit chain journal path (JSONL). Absent = bounded in-memory buffer.
    #[arg(long, env = "AUDIT_JOURNAL")]
    audit_journal: Option<PathBuf>,

    /// Task lineage journal path (JSONL). Absent = in-memory only.
    #[arg(long, env = "TASK_JOURNAL")]
    task_journal: Option<PathBuf>,
}

fn build_bindings(args: &Args) -> Result<BindingTable, ServerError> {
    let mut bindings = BindingTable::new();

    bindings.insert(ProviderBinding::new(
        ProviderId::Ollama,
        Box::new(OllamaAdapter::new(args.ollama_url.clone())?),
    ));
    if let Some(key) = &args.openai_api_key {
        bindings.insert(ProviderBinding::new(
            ProviderId::Openai,
            Box::new(OpenAiAdapter::new(
                args.openai_base_url.clone(),
                Some(key.clone()),
            )?),
        ));
    }
    if let Some(key) = &args.anthropic_api_key {
        bindings.insert(ProviderBinding::new(
            ProviderId::Anthropic,
            Box::new(AnthropicAdapter::new(
                args.anthropic_base_url.clone(),
                key.clone(),
            )?),
        ));
    }
    // together and gemini speak the openai-compatible dialect
    if let Some(key) = &args.together_api_key {
        bindings.insert(ProviderBinding::new(
            ProviderId::Together,
            Box::new(OpenAiAdapter::new(
                args.together_base_url.clone(),
                Some(key.clone()),
            )?),
        ));
    }
    if let Some(key) = &args.gemini_api_key {
        bindings.insert(ProviderBinding::new(
            ProviderId::Gemini,
            Box::new(OpenAiAdapter::new(
                args.gemini_base_url.clone(),
                Some(key.clone()),
            )?),
        ));
    }
    Ok(bindings)
}

fn open_chain(journal: &Option<PathBuf>, bounded_cap: Option<usize>) -> Result<Chain, ChainError> {
    match journal {
        Some(path) => Chain::open(path),
        None => Ok(match bounded_cap {
            Some(cap) => Chain::bounded(cap),
            None => Chain::in_memory(),
        }),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

async fn run(args: Args) -> Result<(), ServerError> {
    let verifier = TokenVerifier::new(args.auth_secret.clone());
    if verifier.dev_mode() {
        warn!("GATEWAY_AUTH_SECRET not set: running in development mode, all requests get a synthetic admin principal");
    }

    let audit = Arc::new(open_chain(&args.audit_journal, Some(AUDIT_BUFFER_CAP))?);
    let memory = Arc::new(open_chain(&args.memory_journal, None)?);
    let lineage = Arc::new(open_chain(&args.task_journal, None)?);
    if args.audit_journal.is_some() {
        info!(records = audit.len(), "audit journal replayed");
    }
    if args.memory_journal.is_some() {
        info!(records = memory.len(), "memory journal replayed");
    }

    let bindings = build_bindings(&args)?;
    info!(
        providers = ?bindings.ids().iter().map(|id| id.as_str()).collect::<Vec<_>>(),
        "provider bindings ready"
    );

    let state = Arc::new(GatewayState {
        verifier,
        limiter: RateLimiter::new(LimitConfig::default()),
        bindings,
        tasks: TaskStore::new(lineage),
        audit,
        memory,
    });
    let app = build_router(state);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("gateway stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    // Local-only secrets; absence is fine.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}
