//! Workflow Orchestration Engine — HTTP/JSON control surface entry point.
//!
//! Run with: `cargo run --bin server`. Serves the control surface and `/ws`
//! live stream described in §6 of the specification.

use dotenv::dotenv;
use tracing::info;
use workflow_orchestrator::api::AppState;
use workflow_orchestrator::bootstrap::build_runtime;
use workflow_orchestrator::config::Config;
use workflow_orchestrator::server::{OrchestratorServerBuilder, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if dotenv().is_err() {
        eprintln!("no .env file found; reading configuration from the environment only");
    }
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    info!(
        bind_addr = %config.bind_addr,
        max_concurrency = config.max_concurrency,
        checkpoint_dir = %config.checkpoint_dir,
        "starting workflow orchestration engine"
    );
    if config.openai_api_key.is_some() {
        info!("OpenAI provider configured");
    }
    if config.anthropic_api_key.is_some() {
        info!("Anthropic provider configured");
    }
    info!(base_url = %config.ollama_base_url, "Ollama provider configured");

    let runtime = build_runtime(&config);
    let state = AppState {
        job_manager: runtime.job_manager,
        templates: runtime.templates,
        agents: runtime.agents,
        checkpoint_store: runtime.checkpoint_store,
        artifact_sink: runtime.artifact_sink,
        stream_gateway: runtime.stream_gateway,
    };

    let server = OrchestratorServerBuilder::new()
        .with_config(ServerConfig {
            bind_addr: config.bind_addr.clone(),
            cors_enabled: true,
        })
        .with_state(state)
        .build();

    server.run().await?;
    Ok(())
}
