// [[POSTLINE]]/apps/runner-server/src/agent.rs
// Purpose: Boundary to the agent service that performs one node's task.
// Architecture: Integration Layer
// Dependencies: reqwest, async-trait, regex, serde_json

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AccountContext, AgentType, AiProvider};

/// Everything an agent needs to perform one node's task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub node_type: AgentType,
    pub config: Option<serde_json::Value>,
    pub provider: AiProvider,
    /// Formatted result of the previous node, `None` for the first node and
    /// for the node after a skipped one.
    pub previous_output: Option<String>,
    pub account_context: AccountContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    /// Machine-readable result, JSON text when the agent produced any.
    pub output: String,
}

#[derive(Error, Debug)]
pub enum AgentCallError {
    /// The agent answered but reported failure. Displays as the bare message.
    #[error("{0}")]
    Rejected(String),
    #[error("Agent service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Agent service returned HTTP {0}")]
    Status(u16),
    #[error("Malformed agent response: {0}")]
    Decode(String),
}

/// Receives human-readable status lines while a node runs.
pub trait ProgressReporter: Send + Sync {
    fn status_line(&self, line: &str);
}

/// Discards every line.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn status_line(&self, _line: &str) {}
}

#[async_trait]
pub trait AgentCaller: Send + Sync {
    async fn call(
        &self,
        request: AgentRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<AgentResponse, AgentCallError>;
}

#[derive(Debug, Deserialize)]
struct RemoteAgentResponse {
    success: bool,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Calls the agent service over HTTP. The provider API key is supplied at
/// construction and sent with every request.
pub struct HttpAgentCaller {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAgentCaller {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl AgentCaller for HttpAgentCaller {
    async fn call(
        &self,
        request: AgentRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<AgentResponse, AgentCallError> {
        tracing::debug!(
            node_type = ?request.node_type,
            provider = ?request.provider,
            "Sending agent request to: {}",
            self.endpoint
        );
        progress.status_line(&format!("Contacting {} agent...", request.node_type.label()));

        let mut builder = self.http_client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!("Agent service responded with {}", status);
            return Err(AgentCallError::Status(status.as_u16()));
        }

        let body: RemoteAgentResponse = response
            .json()
            .await
            .map_err(|e| AgentCallError::Decode(e.to_string()))?;

        if !body.success {
            return Err(AgentCallError::Rejected(
                body.error.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        let output = match (body.output, body.raw) {
            (Some(serde_json::Value::String(text)), _) => extract_json(&text).unwrap_or(text),
            (Some(value), _) => value.to_string(),
            (None, Some(raw)) => extract_json(&raw).unwrap_or(raw),
            (None, None) => {
                return Err(AgentCallError::Decode("response carried no output".to_string()))
            }
        };

        progress.status_line("Response received");
        Ok(AgentResponse { output })
    }
}

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid fence pattern"))
}

/// Best-effort extraction of a JSON document from LLM text.
///
/// Tries the whole text, then the first markdown code fence, then the
/// outermost `{...}` span.
pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }

    if let Some(caps) = fence_pattern().captures(trimmed) {
        let inner = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if serde_json::from_str::<serde_json::Value>(inner).is_ok() {
            return Some(inner.to_string());
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &trimmed[start..=end];
    serde_json::from_str::<serde_json::Value>(candidate)
        .ok()
        .map(|_| candidate.to_string())
}
