// [[POSTLINE]]/apps/runner-server/src/server/handlers.rs
// Purpose: API Handlers. Start, inspect and steer pipeline runs.
// Architecture: API Layer
// Dependencies: Axum, Runtime

use axum::extract::ws::Message;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Json, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::events::{EventType, RunEvent};
use crate::models::*;
use crate::runtime::{PipelineRunner, RunnerError, RunnerState};
use crate::server::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub nodes: Vec<AgentNode>,
    #[serde(default)]
    pub connections: Vec<PipelineConnection>,
    #[serde(default)]
    pub account_context: Option<AccountContext>,
    #[serde(default)]
    pub provider: Option<AiProvider>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    message: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Postline runner is running".to_string(),
    })
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "success": false, "error": message.into() })))
}

fn runner_error(e: RunnerError) -> ApiError {
    let status = match e {
        RunnerError::NoRun => StatusCode::NOT_FOUND,
        RunnerError::RunInProgress(_) | RunnerError::NotHalted { .. } | RunnerError::NotRunning => {
            StatusCode::CONFLICT
        }
    };
    api_error(status, e.to_string())
}

fn find_runner(state: &AppState, pipeline_id: &str) -> Result<Arc<PipelineRunner>, ApiError> {
    state
        .runner(pipeline_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No runs for pipeline {}", pipeline_id)))
}

pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<String>,
    Json(req): Json<StartRunRequest>,
) -> Json<serde_json::Value> {
    let runner = Arc::new(
        PipelineRunner::new(
            pipeline_id.clone(),
            req.nodes,
            req.connections,
            Arc::clone(&state.caller),
        )
        .with_provider(req.provider.unwrap_or(state.default_provider))
        .with_account_context(req.account_context.unwrap_or_default())
        .with_event_capacity(state.event_buffer),
    );

    if let Some(previous) = state.runners.insert(pipeline_id.clone(), Arc::clone(&runner)) {
        if previous.stop().is_ok() {
            tracing::info!("Stopped previous run of pipeline {} to start a new one", previous.pipeline_id());
        }
    }

    let run_id = runner.start();
    Json(json!({
        "success": true,
        "runId": run_id
    }))
}

pub async fn get_run_state(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<String>,
) -> Result<Json<RunnerState>, ApiError> {
    let runner = find_runner(&state, &pipeline_id)?;
    Ok(Json(runner.state()))
}

pub async fn stop_run(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<String>,
) -> Result<Json<PipelineRun>, ApiError> {
    let runner = find_runner(&state, &pipeline_id)?;
    let run = runner.stop().map_err(runner_error)?;
    Ok(Json((*run).clone()))
}

pub async fn retry_run(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<String>,
) -> Result<Json<PipelineRun>, ApiError> {
    let runner = find_runner(&state, &pipeline_id)?;
    let run = runner.retry().map_err(runner_error)?;
    Ok(Json((*run).clone()))
}

pub async fn skip_run(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<String>,
) -> Result<Json<PipelineRun>, ApiError> {
    let runner = find_runner(&state, &pipeline_id)?;
    let run = runner.skip().map_err(runner_error)?;
    Ok(Json((*run).clone()))
}

pub async fn ws_run_stream(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let runner = state.runner(&pipeline_id);
    ws.on_upgrade(move |socket| handle_run_stream(socket, runner, pipeline_id))
}

fn state_message(state: &RunnerState) -> Message {
    Message::Text(
        json!({
            "type": "state_update",
            "state": state,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })
        .to_string(),
    )
}

/// A halted run stays open for retry/skip; completed and stopped runs end
/// the stream.
fn stream_finished(state: &RunnerState) -> bool {
    matches!(
        state.run.as_ref().map(|r| r.status),
        Some(RunStatus::Completed) | Some(RunStatus::Stopped)
    )
}

fn closes_stream(event: &RunEvent) -> bool {
    matches!(event.event_type, EventType::RunCompleted | EventType::RunStopped)
}

/// Upper bound on how long a finished stream waits for the run's closing
/// event, which the runner emits right after publishing the final state.
const CLOSING_EVENT_GRACE: Duration = Duration::from_secs(2);

type WsSender = SplitSink<WebSocket, Message>;

async fn send_event(sender: &mut WsSender, event: &RunEvent) -> Result<(), axum::Error> {
    let msg = json!({ "type": "event", "event": event }).to_string();
    sender.send(Message::Text(msg)).await
}

/// Forward events until the closing event of `run_id` has been sent.
async fn forward_until_closing(sender: &mut WsSender, events: &mut broadcast::Receiver<RunEvent>, run_id: &str) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let last = event.run_id == run_id && closes_stream(&event);
                if send_event(sender, &event).await.is_err() || last {
                    return;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}

async fn handle_run_stream(socket: WebSocket, runner: Option<Arc<PipelineRunner>>, pipeline_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let runner = match runner {
        Some(r) => r,
        None => {
            let _ = sender
                .send(Message::Text(json!({"error": "Pipeline has no runs"}).to_string()))
                .await;
            let _ = sender.close().await;
            return;
        }
    };

    let mut state_rx = runner.subscribe();
    let mut events = runner.events();

    let initial = state_rx.borrow_and_update().clone();
    if sender.send(state_message(&initial)).await.is_err() {
        return;
    }
    if stream_finished(&initial) {
        let _ = sender.close().await;
        return;
    }

    // Run id of the last closing event already forwarded
    let mut closed_run: Option<String> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                if msg.is_none() {
                    tracing::info!("Client disconnected from run stream: {}", pipeline_id);
                    break;
                }
            }

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state_rx.borrow_and_update().clone();
                if sender.send(state_message(&current)).await.is_err() {
                    tracing::info!("Failed to send state update, client disconnected");
                    break;
                }
                if let Some(run) = current.run.as_ref().filter(|_| stream_finished(&current)) {
                    if closed_run.as_deref() != Some(run.id.as_str()) {
                        let flushed = tokio::time::timeout(
                            CLOSING_EVENT_GRACE,
                            forward_until_closing(&mut sender, &mut events, &run.id),
                        )
                        .await;
                        if flushed.is_err() {
                            tracing::warn!("Run {} finished without a closing event", run.id);
                        }
                    }
                    tracing::info!("Run stream for pipeline {} reached a final state. Closing.", pipeline_id);
                    let _ = sender.close().await;
                    break;
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if closes_stream(&event) {
                            closed_run = Some(event.run_id.clone());
                        }
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Run stream for pipeline {} skipped {} events", pipeline_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}
