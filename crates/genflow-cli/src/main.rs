use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use genflow_core::PipelineConfig;
use genflow_core::app::PipelineBuilder;
use genflow_core::domain::RoutingTable;
use genflow_core::http::router;
use genflow_core::impls::ScriptedProvider;
use genflow_core::observability::{LogFormat, init_tracing};
use genflow_core::ports::ModelProvider;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

/// Serves the generation pipeline over HTTP, backed by in-memory stores and
/// a scripted model provider.
#[derive(Debug, Parser)]
#[command(name = "genflow", version)]
struct Args {
    #[arg(long, env = "GENFLOW_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// JSON pipeline config; defaults apply when omitted.
    #[arg(long, env = "GENFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "GENFLOW_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Overrides `queue.dispatchers`.
    #[arg(long, env = "GENFLOW_DISPATCHERS")]
    dispatchers: Option<usize>,

    /// Delay between scripted tokens, in milliseconds.
    #[arg(long, env = "GENFLOW_TOKEN_DELAY_MS", default_value_t = 40)]
    token_delay_ms: u64,
}

/// Every stage's required fields, so batch stages validate too.
const DEMO_REPLY: [&str; 6] = [
    "{\"summary\": \"A backend role ",
    "focused on streaming ",
    "pipelines.\", ",
    "\"score\": 0.82, ",
    "\"text\": \"scanned\", ",
    "\"questions\": []}",
];

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    PipelineConfig::from_json_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // (A) env + args + logging
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = load_config(args.config.as_ref())?;
    let dispatchers = args.dispatchers.unwrap_or(config.queue.dispatchers);

    // (B) one scripted provider serves every routable model
    let provider: Arc<dyn ModelProvider> = Arc::new(
        ScriptedProvider::tokens(DEMO_REPLY).with_token_delay(Duration::from_millis(args.token_delay_ms)),
    );
    let mut builder = PipelineBuilder::new(config.clone());
    for model_id in RoutingTable::new(config.routing.clone()).model_ids() {
        builder = builder.register_shared_provider(model_id, Arc::clone(&provider))?;
    }
    let pipeline = builder.expect_all_models().build()?;

    // (C) dispatchers drain the queue into the worker
    let group = pipeline.spawn_dispatchers(dispatchers);

    // (D) serve until ctrl-c, then stop dispatchers
    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %args.bind, dispatchers, environment = ?config.environment, "genflow listening");

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    group.shutdown_and_join().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
