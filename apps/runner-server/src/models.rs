use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    Researcher,
    Strategist,
    Writer,
    MediaCreator,
    Editor,
    Scheduler,
    Publisher,
    Analyst,
}

impl AgentType {
    pub fn label(&self) -> &'static str {
        match self {
            AgentType::Researcher => "Trend Researcher",
            AgentType::Strategist => "Content Strategist",
            AgentType::Writer => "Content Writer",
            AgentType::MediaCreator => "Media Creator",
            AgentType::Editor => "Editor",
            AgentType::Scheduler => "Scheduler",
            AgentType::Publisher => "Publisher",
            AgentType::Analyst => "Performance Analyst",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Unconfigured,
    Configured,
    Error,
}

/// How much human approval a node wants before acting. The runner does not
/// enforce it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    Manual,
    #[default]
    Assisted,
    Autonomous,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNode {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub name: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl AgentNode {
    pub fn new(id: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            agent_type,
            name: agent_type.label().to_string(),
            position: Position::default(),
            config: None,
            status: NodeStatus::Unconfigured,
            autonomy: AutonomyLevel::default(),
            active: true,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self.status = NodeStatus::Configured;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConnection {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
}

impl PipelineConnection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_node_id: source.into(),
            target_node_id: target.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Draft,
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub nodes: Vec<AgentNode>,
    pub connections: Vec<PipelineConnection>,
    pub account_ids: Vec<String>,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            nodes: Vec::new(),
            connections: Vec::new(),
            account_ids: Vec::new(),
            status: PipelineStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_node(&mut self, node: AgentNode) {
        self.nodes.push(node);
        self.updated_at = Utc::now();
    }

    /// Adds a `source -> target` edge and returns its id.
    pub fn connect(&mut self, source: &str, target: &str) -> String {
        let connection = PipelineConnection::new(source, target);
        let id = connection.id.clone();
        self.connections.push(connection);
        self.updated_at = Utc::now();
        id
    }

    /// Attaches or replaces a node's configuration.
    pub fn configure_node(&mut self, node_id: &str, config: serde_json::Value) -> Option<&AgentNode> {
        let node = self.nodes.iter_mut().find(|n| n.id == node_id)?;
        node.config = Some(config);
        node.status = NodeStatus::Configured;
        self.updated_at = Utc::now();
        Some(node)
    }

    /// Removes a node and its connections. When the node sat in the middle of
    /// the chain, its incoming and outgoing edges are merged so the chain
    /// stays connected.
    pub fn remove_node(&mut self, node_id: &str) -> Option<AgentNode> {
        let index = self.nodes.iter().position(|n| n.id == node_id)?;
        let removed = self.nodes.remove(index);

        let incoming: Vec<&PipelineConnection> = self
            .connections
            .iter()
            .filter(|c| c.target_node_id == node_id)
            .collect();
        let outgoing: Vec<&PipelineConnection> = self
            .connections
            .iter()
            .filter(|c| c.source_node_id == node_id)
            .collect();

        let bridge = match (incoming.as_slice(), outgoing.as_slice()) {
            ([inc], [out]) if inc.source_node_id != out.target_node_id => Some(PipelineConnection::new(
                inc.source_node_id.clone(),
                out.target_node_id.clone(),
            )),
            _ => None,
        };

        self.connections
            .retain(|c| c.source_node_id != node_id && c.target_node_id != node_id);
        if let Some(bridge) = bridge {
            self.connections.push(bridge);
        }

        self.updated_at = Utc::now();
        Some(removed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRunStatus {
    Idle,
    Running,
    Complete,
    Error,
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRun {
    pub node_id: String,
    pub status: NodeRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub output: Vec<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl NodeRun {
    pub fn idle(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeRunStatus::Idle,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: Vec::new(),
            result: None,
            error: None,
        }
    }

    pub fn reset(&mut self) {
        *self = NodeRun::idle(std::mem::take(&mut self.node_id));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub node_runs: Vec<NodeRun>,
}

impl PipelineRun {
    pub fn new(pipeline_id: impl Into<String>, order: &[String]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            node_runs: order.iter().map(NodeRun::idle).collect(),
        }
    }

    /// Index of the node that halted the run, if any.
    pub fn failure_index(&self) -> Option<usize> {
        self.node_runs
            .iter()
            .position(|n| n.status == NodeRunStatus::Error)
    }

    pub fn finish(&mut self, status: RunStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
        self.duration_ms = Some(elapsed_ms(self.started_at, at));
    }
}

pub fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Tiktok,
    Youtube,
}

/// Accounts a pipeline publishes to, handed to every agent call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountContext {
    #[serde(default)]
    pub account_ids: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(default)]
    pub brand_voice: Option<String>,
}
