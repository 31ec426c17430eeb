//! HTTP/SSE server binary.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use toolchat::llm::{default_model, get_model, provider_for};
use toolchat::reduce::ApproxCounter;
use toolchat::server::AppState;
use toolchat::tools::init_registry;

/// Serve conversations over the v2 HTTP/SSE API.
#[derive(Debug, Parser)]
#[command(name = "toolchat-server", version, about)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 5700)]
    port: u16,

    /// Default model id (`provider/model`).
    #[arg(long, env = "MODEL")]
    model: Option<String>,

    /// Comma-separated tool allowlist.
    #[arg(long, env = "TOOL_ALLOWLIST")]
    tools: Option<String>,

    /// Increase log verbosity.
    #[arg(short, long)]
    verbose: bool,
}

/// Idle sessions older than this are swept.
const SESSION_MAX_AGE_MINUTES: i64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let allowlist: Option<Vec<String>> = cli.tools.as_ref().map(|csv| {
        csv.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    });
    let registry = init_registry(allowlist.as_deref());

    let model_id = cli
        .model
        .clone()
        .or_else(default_model)
        .context("no model configured; pass --model or set MODEL")?;
    let provider = provider_for(&get_model(&model_id))?;

    let logs_home = toolchat::dirs::logs_home();
    std::fs::create_dir_all(&logs_home)
        .with_context(|| format!("creating logs home {}", logs_home.display()))?;

    let state = AppState::new(
        registry,
        provider,
        Arc::new(ApproxCounter),
        logs_home.clone(),
        model_id.clone(),
    );

    // Background sweep of idle sessions.
    let sweeper = state.sessions.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            sweeper.clean_inactive(chrono::Duration::minutes(SESSION_MAX_AGE_MINUTES));
        }
    });

    let app = toolchat::server::router(state);
    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(%addr, model = %model_id, logs = %logs_home.display(), "toolchat-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
