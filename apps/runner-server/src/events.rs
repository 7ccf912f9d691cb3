// [[POSTLINE]]/apps/runner-server/src/events.rs
// Purpose: Event definitions emitted by the pipeline runner.
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono, Uuid

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    /// A fresh run was installed and its driver spawned
    RunStarted,
    /// A node entered `running`
    NodeStarted,
    /// Status line reported by the agent call while a node runs
    NodeProgress,
    /// A node finished successfully
    NodeCompleted,
    /// A node's agent call failed; the run halts
    NodeFailed,
    /// A node was interrupted by `stop()`
    NodeCancelled,
    /// A failed node was skipped by the operator
    NodeSkipped,
    RunCompleted,
    RunFailed,
    RunStopped,
    /// A halted run was resumed by `retry()` or `skip()`
    RunResumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: String,
    pub run_id: String,
    pub event_type: EventType,
    pub node_id: Option<String>,
    pub timestamp: String,
    pub payload: Value,
}

impl RunEvent {
    pub fn new(run_id: &str, event_type: EventType, node_id: Option<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            event_type,
            node_id,
            timestamp: Utc::now().to_rfc3339(),
            payload,
        }
    }
}
