pub mod handlers;

use std::sync::Arc;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::agent::AgentCaller;
use crate::models::AiProvider;
use crate::runtime::PipelineRunner;

/// One runner per pipeline; starting a new run for a pipeline replaces its
/// runner.
pub struct AppState {
    // Holds at most one runner (and its last run) per pipeline id, so the
    // map is bounded by the number of pipelines ever started. Settled runs
    // stay readable through `GET /pipelines/:id/run`.

    pub runners: DashMap<String, Arc<PipelineRunner>>,
    pub caller: Arc<dyn AgentCaller>,
    pub default_provider: AiProvider,
    pub event_buffer: usize,
}

impl AppState {
    pub fn new(caller: Arc<dyn AgentCaller>, default_provider: AiProvider, event_buffer: usize) -> Self {
        Self {
            runners: DashMap::new(),
            caller,
            default_provider,
            event_buffer,
        }
    }

    pub fn runner(&self, pipeline_id: &str) -> Option<Arc<PipelineRunner>> {
        self.runners.get(pipeline_id).map(|r| Arc::clone(r.value()))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/pipelines/:pipeline_id/runs", post(handlers::start_run))
        .route("/pipelines/:pipeline_id/run", get(handlers::get_run_state))
        .route("/pipelines/:pipeline_id/run/stop", post(handlers::stop_run))
        .route("/pipelines/:pipeline_id/run/retry", post(handlers::retry_run))
        .route("/pipelines/:pipeline_id/run/skip", post(handlers::skip_run))
        .route("/ws/pipelines/:pipeline_id", get(handlers::ws_run_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
