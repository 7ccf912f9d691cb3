// [[POSTLINE]]/apps/runner-server/src/main.rs
// Purpose: Entry point. Loads configuration, picks the agent backend and starts the server.
// Architecture: Application Boot
// Dependencies: Axum, Tower, Tokio

use std::sync::Arc;

use anyhow::Context;

use postline_runner::agent::{AgentCaller, HttpAgentCaller};
use postline_runner::config::{AgentMode, Config};
use postline_runner::server::{self, AppState};
use postline_runner::simulator::SimulatedAgentCaller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("postline_runner=debug".parse()?)
                .add_directive("tower_http=trace".parse()?),
        )
        .init();

    tracing::info!("Initializing Postline runner...");

    let config = Config::from_env()?;

    let caller: Arc<dyn AgentCaller> = match &config.agent_mode {
        AgentMode::Http { endpoint } => {
            tracing::info!("Agent calls go to {} ({:?})", endpoint, config.provider);
            Arc::new(HttpAgentCaller::new(endpoint.clone(), config.api_key.clone()))
        }
        AgentMode::Simulated { step_delay } => {
            tracing::warn!("AGENT_MODE=simulated. Agent calls return canned output.");
            Arc::new(SimulatedAgentCaller::new(*step_delay))
        }
    };

    let state = Arc::new(AppState::new(caller, config.provider, config.event_buffer));
    let app = server::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("Postline runner listening on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
