// [[POSTLINE]]/apps/runner-server/src/runtime.rs
// Purpose: Sequential pipeline runner with stop, retry and skip.
// Architecture: Domain Logic Layer
// Dependencies: tokio, tokio-util, serde_json

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentCaller, AgentRequest, ProgressReporter};
use crate::events::{EventType, RunEvent};
use crate::formatter::format_node_result;
use crate::models::*;
use crate::order::resolve_execution_order;

const DEFAULT_EVENT_CAPACITY: usize = 100;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
    #[error("No run has been started")]
    NoRun,
    #[error("Run {0} is still running")]
    RunInProgress(String),
    #[error("Run {run_id} is {status:?}; only a halted run can be resumed")]
    NotHalted { run_id: String, status: RunStatus },
    #[error("No run is currently running")]
    NotRunning,
}

/// What the UI shows while a node runs.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatus {
    pub active_node_id: Option<String>,
    pub streaming_text: String,
}

/// Published on every transition. `run` is replaced, never edited, while a
/// reader may still hold the previous snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerState {
    pub run: Option<Arc<PipelineRun>>,
    #[serde(flatten)]
    pub live: LiveStatus,
}

#[derive(Default)]
struct Control {
    abort: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

pub struct PipelineRunner {
    pipeline_id: String,
    nodes: Vec<AgentNode>,
    connections: Vec<PipelineConnection>,
    node_index: HashMap<String, usize>,
    caller: Arc<dyn AgentCaller>,
    provider: AiProvider,
    account_context: AccountContext,
    state: watch::Sender<RunnerState>,
    event_bus: broadcast::Sender<RunEvent>,
    control: Mutex<Control>,
}

impl PipelineRunner {
    pub fn new(
        pipeline_id: impl Into<String>,
        nodes: Vec<AgentNode>,
        connections: Vec<PipelineConnection>,
        caller: Arc<dyn AgentCaller>,
    ) -> Self {
        let node_index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let (state, _) = watch::channel(RunnerState::default());
        let (event_bus, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);

        PipelineRunner {
            pipeline_id: pipeline_id.into(),
            nodes,
            connections,
            node_index,
            caller,
            provider: AiProvider::default(),
            account_context: AccountContext::default(),
            state,
            event_bus,
            control: Mutex::new(Control::default()),
        }
    }

    pub fn with_provider(mut self, provider: AiProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_account_context(mut self, account_context: AccountContext) -> Self {
        self.account_context = account_context;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (event_bus, _) = broadcast::channel(capacity.max(1));
        self.event_bus = event_bus;
        self
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    // === READ SIDE ===

    pub fn state(&self) -> RunnerState {
        self.state.borrow().clone()
    }

    pub fn current_run(&self) -> Option<Arc<PipelineRun>> {
        self.state.borrow().run.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }

    /// Wait for the current driver task to settle.
    pub async fn wait(&self) {
        let handle = self.control().driver.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Driver task for pipeline {} ended abnormally: {}", self.pipeline_id, e);
            }
        }
    }

    // === CONTROL ===

    /// Start a fresh run, replacing whatever run this runner held.
    pub fn start(self: &Arc<Self>) -> String {
        let order = resolve_execution_order(&self.nodes, &self.connections);
        let run = PipelineRun::new(&self.pipeline_id, &order);
        let run_id = run.id.clone();

        let mut control = self.control();
        control.abort.cancel();

        self.state.send_replace(RunnerState {
            run: Some(Arc::new(run)),
            live: LiveStatus::default(),
        });

        tracing::info!(
            "Starting run {} for pipeline {} ({} nodes)",
            run_id,
            self.pipeline_id,
            order.len()
        );
        self.emit(RunEvent::new(
            &run_id,
            EventType::RunStarted,
            None,
            serde_json::json!({ "pipeline_id": self.pipeline_id, "order": order }),
        ));

        self.spawn_driver(&mut control, run_id.clone(), 0, None);
        run_id
    }

    /// Cancel the running run. The node in flight becomes `cancelled`; nodes
    /// that never started stay `idle`.
    pub fn stop(&self) -> Result<Arc<PipelineRun>, RunnerError> {
        let control = self.control();

        let mut outcome = Err(RunnerError::NotRunning);
        self.state.send_if_modified(|state| {
            let run = match state.run.as_mut() {
                Some(run) if run.status == RunStatus::Running => Arc::make_mut(run),
                _ => return false,
            };
            let now = Utc::now();
            let mut cancelled = None;
            if let Some(node) = run.node_runs.iter_mut().find(|n| n.status == NodeRunStatus::Running) {
                node.status = NodeRunStatus::Cancelled;
                node.completed_at = Some(now);
                node.duration_ms = node.started_at.map(|s| elapsed_ms(s, now));
                cancelled = Some(node.node_id.clone());
            }
            run.finish(RunStatus::Stopped, now);
            state.live.active_node_id = None;
            outcome = Ok((run.id.clone(), cancelled));
            true
        });
        let (run_id, cancelled) = outcome?;

        control.abort.cancel();

        if let Some(node_id) = cancelled {
            self.emit(RunEvent::new(&run_id, EventType::NodeCancelled, Some(node_id), serde_json::json!({})));
        }
        self.emit(RunEvent::new(&run_id, EventType::RunStopped, None, serde_json::json!({})));
        tracing::info!("Run {} stopped by operator", run_id);

        self.current_run().ok_or(RunnerError::NoRun)
    }

    /// Re-run a halted run from the node that failed. Earlier nodes keep
    /// their results; the failing node and everything after it start over.
    pub fn retry(self: &Arc<Self>) -> Result<Arc<PipelineRun>, RunnerError> {
        let mut control = self.control();

        let mut outcome = Err(RunnerError::NoRun);
        self.state.send_if_modified(|state| {
            let index = match halted_at(state.run.as_deref()) {
                Ok(index) => index,
                Err(e) => {
                    outcome = Err(e);
                    return false;
                }
            };
            let Some(slot) = state.run.as_mut() else {
                return false;
            };
            let run = Arc::make_mut(slot);

            for node in run.node_runs.iter_mut().skip(index) {
                node.reset();
            }
            let previous = run.node_runs[..index]
                .iter()
                .rev()
                .find(|n| n.status == NodeRunStatus::Complete)
                .and_then(|n| n.result.clone());

            resume(run);
            state.live = LiveStatus::default();
            outcome = Ok((run.id.clone(), index, previous));
            true
        });
        let (run_id, index, previous) = outcome?;

        tracing::info!("Retrying run {} from node index {}", run_id, index);
        self.emit(RunEvent::new(
            &run_id,
            EventType::RunResumed,
            None,
            serde_json::json!({ "action": "retry", "from_index": index }),
        ));

        self.spawn_driver(&mut control, run_id, index, previous);
        self.current_run().ok_or(RunnerError::NoRun)
    }

    /// Mark the failed node `skipped` without calling its agent and continue
    /// with the next node. The failed attempt is discarded: the skipped node
    /// keeps only `completed_at`, with no output, error or timing. The next
    /// node receives no previous output.
    pub fn skip(self: &Arc<Self>) -> Result<Arc<PipelineRun>, RunnerError> {
        let mut control = self.control();

        let mut outcome = Err(RunnerError::NoRun);
        self.state.send_if_modified(|state| {
            let index = match halted_at(state.run.as_deref()) {
                Ok(index) => index,
                Err(e) => {
                    outcome = Err(e);
                    return false;
                }
            };
            let Some(slot) = state.run.as_mut() else {
                return false;
            };
            let run = Arc::make_mut(slot);

            let node = &mut run.node_runs[index];
            node.reset();
            node.status = NodeRunStatus::Skipped;
            node.completed_at = Some(Utc::now());
            let node_id = node.node_id.clone();

            resume(run);
            state.live = LiveStatus::default();
            outcome = Ok((run.id.clone(), index, node_id));
            true
        });
        let (run_id, index, node_id) = outcome?;

        tracing::info!("Skipping node {} in run {}", node_id, run_id);
        self.emit(RunEvent::new(&run_id, EventType::NodeSkipped, Some(node_id), serde_json::json!({})));
        self.emit(RunEvent::new(
            &run_id,
            EventType::RunResumed,
            None,
            serde_json::json!({ "action": "skip", "from_index": index + 1 }),
        ));

        self.spawn_driver(&mut control, run_id, index + 1, None);
        self.current_run().ok_or(RunnerError::NoRun)
    }

    // === EXECUTION LOGIC ===

    fn spawn_driver(
        self: &Arc<Self>,
        control: &mut Control,
        run_id: String,
        from: usize,
        previous_output: Option<String>,
    ) {
        control.abort = CancellationToken::new();
        let abort = control.abort.clone();
        let runner = Arc::clone(self);
        control.driver = Some(tokio::spawn(async move {
            runner.drive(run_id, from, previous_output, abort).await;
        }));
    }

    /// Runs nodes one at a time from `from` until the chain ends, a node
    /// fails, or the run is aborted.
    async fn drive(
        self: Arc<Self>,
        run_id: String,
        from: usize,
        mut previous_output: Option<String>,
        abort: CancellationToken,
    ) {
        let order: Vec<String> = match self.current_run() {
            Some(run) if run.id == run_id => run.node_runs.iter().map(|n| n.node_id.clone()).collect(),
            _ => return,
        };

        for (index, node_id) in order.iter().enumerate().skip(from) {
            if abort.is_cancelled() {
                tracing::debug!("Run {} aborted before node {}", run_id, node_id);
                return;
            }

            let Some(node) = self.node_index.get(node_id).map(|&i| &self.nodes[i]) else {
                let message = format!("Node {} is not part of this pipeline", node_id);
                self.fail_node(&run_id, index, &message);
                return;
            };

            if !self.begin_node(&run_id, index) {
                return;
            }
            tracing::info!("Processing node {} ({:?}) in run {}", node_id, node.agent_type, run_id);
            self.emit(RunEvent::new(
                &run_id,
                EventType::NodeStarted,
                Some(node_id.clone()),
                serde_json::json!({ "index": index, "type": node.agent_type }),
            ));

            let request = AgentRequest {
                node_type: node.agent_type,
                config: node.config.clone(),
                provider: self.provider,
                previous_output: previous_output.take(),
                account_context: self.account_context.clone(),
            };
            let progress = NodeProgress {
                runner: self.as_ref(),
                run_id: &run_id,
                node_id,
                index,
            };

            let outcome = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    tracing::debug!("Run {} aborted while node {} was in flight", run_id, node_id);
                    return;
                }
                outcome = self.caller.call(request, &progress) => outcome,
            };

            match outcome {
                Ok(response) => {
                    let result = format_node_result(node.agent_type, &response.output);
                    let Some(duration_ms) = self.complete_node(&run_id, index, &result) else {
                        return;
                    };
                    self.emit(RunEvent::new(
                        &run_id,
                        EventType::NodeCompleted,
                        Some(node_id.clone()),
                        serde_json::json!({ "duration_ms": duration_ms, "result": result }),
                    ));
                    previous_output = Some(result);
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!("Run {} failed at node {}: {}", run_id, node_id, message);
                    self.fail_node(&run_id, index, &message);
                    return;
                }
            }
        }

        let finished = self.commit(&run_id, |run, live| {
            run.finish(RunStatus::Completed, Utc::now());
            live.active_node_id = None;
            true
        });
        if finished {
            tracing::info!("Run {} completed successfully", run_id);
            self.emit(RunEvent::new(&run_id, EventType::RunCompleted, None, serde_json::json!({})));
        }
    }

    /// Apply `f` to the run if it is still the current one and still
    /// running. Returns whether anything was committed.
    fn commit<F>(&self, run_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut PipelineRun, &mut LiveStatus) -> bool,
    {
        self.state.send_if_modified(|state| match state.run.as_mut() {
            Some(run) if run.id == run_id && run.status == RunStatus::Running => {
                f(Arc::make_mut(run), &mut state.live)
            }
            _ => false,
        })
    }

    fn begin_node(&self, run_id: &str, index: usize) -> bool {
        self.commit(run_id, |run, live| {
            let Some(node) = run.node_runs.get_mut(index) else {
                return false;
            };
            if node.status != NodeRunStatus::Idle {
                return false;
            }
            node.status = NodeRunStatus::Running;
            node.started_at = Some(Utc::now());
            live.active_node_id = Some(node.node_id.clone());
            live.streaming_text.clear();
            true
        })
    }

    fn report_line(&self, run_id: &str, index: usize, line: &str) -> bool {
        self.commit(run_id, |run, live| match run.node_runs.get_mut(index) {
            Some(node) if node.status == NodeRunStatus::Running => {
                node.output.push(line.to_string());
                if !live.streaming_text.is_empty() {
                    live.streaming_text.push('\n');
                }
                live.streaming_text.push_str(line);
                true
            }
            _ => false,
        })
    }

    fn complete_node(&self, run_id: &str, index: usize, result: &str) -> Option<u64> {
        let mut duration = None;
        self.commit(run_id, |run, live| match run.node_runs.get_mut(index) {
            Some(node) if node.status == NodeRunStatus::Running => {
                let now = Utc::now();
                let ms = node.started_at.map(|s| elapsed_ms(s, now)).unwrap_or(0);
                node.status = NodeRunStatus::Complete;
                node.completed_at = Some(now);
                node.duration_ms = Some(ms);
                node.result = Some(result.to_string());
                node.output.push(format!("Completed in {:.1}s", ms as f64 / 1000.0));
                live.active_node_id = None;
                duration = Some(ms);
                true
            }
            _ => false,
        });
        duration
    }

    fn fail_node(&self, run_id: &str, index: usize, message: &str) {
        let mut failed_node = None;
        let halted = self.commit(run_id, |run, live| {
            let now = Utc::now();
            let Some(node) = run.node_runs.get_mut(index) else {
                return false;
            };
            node.status = NodeRunStatus::Error;
            node.completed_at = Some(now);
            node.duration_ms = node.started_at.map(|s| elapsed_ms(s, now));
            node.error = Some(message.to_string());
            node.output.push(format!("Error: {}", message));
            failed_node = Some(node.node_id.clone());
            run.finish(RunStatus::Error, now);
            live.active_node_id = None;
            true
        });

        if halted {
            self.emit(RunEvent::new(
                run_id,
                EventType::NodeFailed,
                failed_node,
                serde_json::json!({ "error": message }),
            ));
            self.emit(RunEvent::new(
                run_id,
                EventType::RunFailed,
                None,
                serde_json::json!({ "error": message, "index": index }),
            ));
        }
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.event_bus.send(event);
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Index of the failed node of a run halted by an error.
fn halted_at(run: Option<&PipelineRun>) -> Result<usize, RunnerError> {
    let run = run.ok_or(RunnerError::NoRun)?;
    match run.status {
        RunStatus::Running => Err(RunnerError::RunInProgress(run.id.clone())),
        RunStatus::Error => run.failure_index().ok_or_else(|| RunnerError::NotHalted {
            run_id: run.id.clone(),
            status: run.status,
        }),
        status => Err(RunnerError::NotHalted {
            run_id: run.id.clone(),
            status,
        }),
    }
}

fn resume(run: &mut PipelineRun) {
    run.status = RunStatus::Running;
    run.completed_at = None;
    run.duration_ms = None;
}

/// Routes an agent's status lines into the running node's output.
struct NodeProgress<'a> {
    runner: &'a PipelineRunner,
    run_id: &'a str,
    node_id: &'a str,
    index: usize,
}

impl ProgressReporter for NodeProgress<'_> {
    fn status_line(&self, line: &str) {
        if self.runner.report_line(self.run_id, self.index, line) {
            self.runner.emit(RunEvent::new(
                self.run_id,
                EventType::NodeProgress,
                Some(self.node_id.to_string()),
                serde_json::json!({ "line": line }),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentCallError, AgentResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedCaller {
        failures: Mutex<HashMap<AgentType, VecDeque<String>>>,
        requests: Mutex<Vec<AgentRequest>>,
        hang_on: Mutex<Option<AgentType>>,
        entered: Notify,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        probe: Mutex<Option<watch::Receiver<RunnerState>>>,
        running_seen: Mutex<Vec<usize>>,
    }

    impl ScriptedCaller {
        fn fail_once(self, agent_type: AgentType, message: &str) -> Self {
            self.failures
                .lock()
                .unwrap()
                .entry(agent_type)
                .or_default()
                .push_back(message.to_string());
            self
        }

        fn hang_on(self, agent_type: AgentType) -> Self {
            *self.hang_on.lock().unwrap() = Some(agent_type);
            self
        }

        fn requests(&self) -> Vec<AgentRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn canned(agent_type: AgentType) -> String {
        match agent_type {
            AgentType::Researcher => r#"{"summary": "Reels are trending", "trends": ["reels"]}"#,
            AgentType::Writer => r#"{"caption": "Fresh take", "hashtags": ["rust"]}"#,
            AgentType::Publisher => r#"{"platform": "instagram", "status": "published"}"#,
            _ => r#"{"note": "done"}"#,
        }
        .to_string()
    }

    #[async_trait]
    impl AgentCaller for ScriptedCaller {
        async fn call(
            &self,
            request: AgentRequest,
            progress: &dyn ProgressReporter,
        ) -> Result<AgentResponse, AgentCallError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let running = self.probe.lock().unwrap().as_ref().map(|rx| {
                rx.borrow()
                    .run
                    .as_ref()
                    .map(|r| {
                        r.node_runs
                            .iter()
                            .filter(|n| n.status == NodeRunStatus::Running)
                            .count()
                    })
                    .unwrap_or(0)
            });
            if let Some(running) = running {
                self.running_seen.lock().unwrap().push(running);
            }

            let agent_type = request.node_type;
            self.requests.lock().unwrap().push(request);
            progress.status_line(&format!("Working on {}", agent_type.label()));
            tokio::task::yield_now().await;

            let hang = {
                let mut slot = self.hang_on.lock().unwrap();
                if *slot == Some(agent_type) {
                    slot.take();
                    true
                } else {
                    false
                }
            };
            if hang {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }

            let failure = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&agent_type)
                .and_then(|q| q.pop_front());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match failure {
                Some(message) => Err(AgentCallError::Rejected(message)),
                None => Ok(AgentResponse {
                    output: canned(agent_type),
                }),
            }
        }
    }

    fn content_pipeline(caller: Arc<ScriptedCaller>) -> Arc<PipelineRunner> {
        let nodes = vec![
            AgentNode::new("publish", AgentType::Publisher),
            AgentNode::new("research", AgentType::Researcher),
            AgentNode::new("write", AgentType::Writer),
        ];
        let connections = vec![
            PipelineConnection::new("research", "write"),
            PipelineConnection::new("write", "publish"),
        ];
        Arc::new(PipelineRunner::new("pipeline-1", nodes, connections, caller))
    }

    fn statuses(run: &PipelineRun) -> Vec<NodeRunStatus> {
        run.node_runs.iter().map(|n| n.status).collect()
    }

    #[tokio::test]
    async fn test_full_chain_completes_in_order() {
        let caller = Arc::new(ScriptedCaller::default());
        let runner = content_pipeline(caller.clone());

        runner.start();
        runner.wait().await;

        let run = runner.current_run().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert!(run.duration_ms.is_some());
        let ids: Vec<&str> = run.node_runs.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["research", "write", "publish"]);
        assert!(run.node_runs.iter().all(|n| n.status == NodeRunStatus::Complete));

        assert_eq!(run.node_runs[1].result.as_deref(), Some("Fresh take\n#rust"));

        let requests = caller.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].previous_output, None);
        assert_eq!(requests[1].previous_output, run.node_runs[0].result);
        assert_eq!(requests[2].previous_output, run.node_runs[1].result);
    }

    #[tokio::test]
    async fn test_progress_lines_recorded() {
        let caller = Arc::new(ScriptedCaller::default());
        let runner = content_pipeline(caller);

        runner.start();
        runner.wait().await;

        let run = runner.current_run().unwrap();
        let output = &run.node_runs[0].output;
        assert_eq!(output.len(), 2);
        assert_eq!(output[0], "Working on Trend Researcher");
        assert!(output[1].starts_with("Completed in "));

        let state = runner.state();
        assert_eq!(state.live.active_node_id, None);
        assert_eq!(state.live.streaming_text, "Working on Publisher");
    }

    #[tokio::test]
    async fn test_only_one_node_runs_at_a_time() {
        let caller = Arc::new(ScriptedCaller::default());
        let runner = content_pipeline(caller.clone());
        *caller.probe.lock().unwrap() = Some(runner.subscribe());

        runner.start();
        runner.wait().await;

        assert_eq!(caller.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*caller.running_seen.lock().unwrap(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_halt_on_error_leaves_rest_idle() {
        let caller = Arc::new(ScriptedCaller::default().fail_once(AgentType::Writer, "model overloaded"));
        let runner = content_pipeline(caller.clone());

        runner.start();
        runner.wait().await;

        let run = runner.current_run().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(
            statuses(&run),
            vec![NodeRunStatus::Complete, NodeRunStatus::Error, NodeRunStatus::Idle]
        );
        assert_eq!(run.node_runs[1].error.as_deref(), Some("model overloaded"));
        assert_eq!(caller.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_replays_only_from_failure() {
        let caller = Arc::new(ScriptedCaller::default().fail_once(AgentType::Publisher, "rate limited"));
        let runner = content_pipeline(caller.clone());

        runner.start();
        runner.wait().await;

        let failed = runner.current_run().unwrap();
        assert_eq!(failed.status, RunStatus::Error);
        assert_eq!(failed.node_runs[2].status, NodeRunStatus::Error);
        assert_eq!(failed.node_runs[2].error.as_deref(), Some("rate limited"));

        let resumed = runner.retry().unwrap();
        assert_eq!(resumed.status, RunStatus::Running);
        assert_eq!(resumed.node_runs[2], NodeRun::idle("publish"));
        runner.wait().await;

        let run = runner.current_run().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.node_runs[0], failed.node_runs[0]);
        assert_eq!(run.node_runs[1], failed.node_runs[1]);
        assert_eq!(run.node_runs[2].status, NodeRunStatus::Complete);

        let requests = caller.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[3].node_type, AgentType::Publisher);
        assert_eq!(requests[3].previous_output, run.node_runs[1].result);

        // The snapshot taken before the retry was never touched.
        assert_eq!(failed.status, RunStatus::Error);
        assert_eq!(failed.node_runs[2].error.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn test_retry_first_node_has_no_previous_output() {
        let caller = Arc::new(ScriptedCaller::default().fail_once(AgentType::Researcher, "timeout"));
        let runner = content_pipeline(caller.clone());

        runner.start();
        runner.wait().await;
        runner.retry().unwrap();
        runner.wait().await;

        let requests = caller.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[1].node_type, AgentType::Researcher);
        assert_eq!(requests[1].previous_output, None);
        assert_eq!(runner.current_run().unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_skip_advances_without_calling() {
        let caller = Arc::new(ScriptedCaller::default().fail_once(AgentType::Writer, "content policy"));
        let runner = content_pipeline(caller.clone());

        runner.start();
        runner.wait().await;
        runner.skip().unwrap();
        runner.wait().await;

        let run = runner.current_run().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            statuses(&run),
            vec![NodeRunStatus::Complete, NodeRunStatus::Skipped, NodeRunStatus::Complete]
        );
        let skipped = &run.node_runs[1];
        assert!(skipped.completed_at.is_some());
        assert!(skipped.started_at.is_none());
        assert!(skipped.duration_ms.is_none());
        assert!(skipped.output.is_empty());
        assert!(skipped.error.is_none());

        let requests = caller.requests();
        let types: Vec<AgentType> = requests.iter().map(|r| r.node_type).collect();
        assert_eq!(
            types,
            vec![AgentType::Researcher, AgentType::Writer, AgentType::Publisher]
        );
        assert_eq!(requests[2].previous_output, None);
    }

    #[tokio::test]
    async fn test_skip_last_node_completes_run() {
        let caller = Arc::new(ScriptedCaller::default().fail_once(AgentType::Publisher, "rate limited"));
        let runner = content_pipeline(caller.clone());

        runner.start();
        runner.wait().await;
        runner.skip().unwrap();
        runner.wait().await;

        let run = runner.current_run().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.node_runs[2].status, NodeRunStatus::Skipped);
        assert_eq!(caller.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_node() {
        let caller = Arc::new(ScriptedCaller::default().hang_on(AgentType::Writer));
        let runner = content_pipeline(caller.clone());
        let mut events = runner.events();

        runner.start();
        caller.entered.notified().await;

        let run = runner.stop().unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert!(run.completed_at.is_some());
        assert_eq!(
            statuses(&run),
            vec![NodeRunStatus::Complete, NodeRunStatus::Cancelled, NodeRunStatus::Idle]
        );

        runner.wait().await;
        let settled = runner.current_run().unwrap();
        assert_eq!(statuses(&settled), statuses(&run));
        assert_eq!(caller.requests().len(), 2);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.event_type);
        }
        assert!(seen.contains(&EventType::NodeCancelled));
        assert_eq!(seen.last(), Some(&EventType::RunStopped));
    }

    #[tokio::test]
    async fn test_resume_guards() {
        let caller = Arc::new(ScriptedCaller::default().hang_on(AgentType::Researcher));
        let runner = content_pipeline(caller.clone());

        assert_eq!(runner.retry().unwrap_err(), RunnerError::NoRun);
        assert_eq!(runner.stop().unwrap_err(), RunnerError::NotRunning);

        let run_id = runner.start();
        caller.entered.notified().await;
        assert_eq!(runner.retry().unwrap_err(), RunnerError::RunInProgress(run_id.clone()));
        assert_eq!(runner.skip().unwrap_err(), RunnerError::RunInProgress(run_id.clone()));

        runner.stop().unwrap();
        runner.wait().await;
        assert!(matches!(
            runner.retry().unwrap_err(),
            RunnerError::NotHalted { status: RunStatus::Stopped, .. }
        ));
        assert_eq!(runner.stop().unwrap_err(), RunnerError::NotRunning);
    }

    #[tokio::test]
    async fn test_start_replaces_previous_run() {
        let caller = Arc::new(ScriptedCaller::default().hang_on(AgentType::Researcher));
        let runner = content_pipeline(caller.clone());

        let first = runner.start();
        caller.entered.notified().await;
        let second = runner.start();
        runner.wait().await;

        assert_ne!(first, second);
        let run = runner.current_run().unwrap();
        assert_eq!(run.id, second);
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes() {
        let caller = Arc::new(ScriptedCaller::default());
        let runner = Arc::new(PipelineRunner::new("empty", vec![], vec![], caller.clone()));

        runner.start();
        runner.wait().await;

        let run = runner.current_run().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.node_runs.is_empty());
        assert!(caller.requests().is_empty());
    }

    #[tokio::test]
    async fn test_context_threaded_into_requests() {
        let caller = Arc::new(ScriptedCaller::default());
        let nodes = vec![AgentNode::new("w", AgentType::Writer).with_config(serde_json::json!({"tone": "witty"}))];
        let context = AccountContext {
            account_ids: vec!["acct-1".into()],
            platforms: vec![Platform::Tiktok],
            brand_voice: None,
        };
        let runner = Arc::new(
            PipelineRunner::new("p", nodes, vec![], caller.clone())
                .with_provider(AiProvider::OpenAi)
                .with_account_context(context.clone()),
        );

        runner.start();
        runner.wait().await;

        let request = &caller.requests()[0];
        assert_eq!(request.provider, AiProvider::OpenAi);
        assert_eq!(request.account_context, context);
        assert_eq!(request.config, Some(serde_json::json!({"tone": "witty"})));
    }
}
