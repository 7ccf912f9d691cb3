use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::agent::{AgentCallError, AgentCaller, AgentRequest, AgentResponse, ProgressReporter};
use crate::models::AgentType;

/// Stand-in agent service for demos and local development. Reports a few
/// status lines per node, then returns canned output.
pub struct SimulatedAgentCaller {
    step_delay: Duration,
    failures: HashMap<AgentType, String>,
}

impl SimulatedAgentCaller {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            failures: HashMap::new(),
        }
    }

    /// Make every call for `agent_type` fail with `message`.
    pub fn fail_on(mut self, agent_type: AgentType, message: impl Into<String>) -> Self {
        self.failures.insert(agent_type, message.into());
        self
    }
}

#[async_trait]
impl AgentCaller for SimulatedAgentCaller {
    async fn call(
        &self,
        request: AgentRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<AgentResponse, AgentCallError> {
        for line in status_lines(request.node_type) {
            tokio::time::sleep(self.step_delay).await;
            progress.status_line(line);
        }

        if let Some(message) = self.failures.get(&request.node_type) {
            tracing::debug!("Simulated failure for {:?}: {}", request.node_type, message);
            return Err(AgentCallError::Rejected(message.clone()));
        }

        Ok(AgentResponse {
            output: canned_output(request.node_type, request.previous_output.as_deref()).to_string(),
        })
    }
}

fn status_lines(agent_type: AgentType) -> &'static [&'static str] {
    match agent_type {
        AgentType::Researcher => &["Scanning trending topics...", "Ranking by engagement..."],
        AgentType::Strategist => &["Reviewing research...", "Choosing an angle..."],
        AgentType::Writer => &["Drafting caption...", "Picking hashtags...", "Polishing tone..."],
        AgentType::MediaCreator => &["Composing visual concept...", "Writing image prompt..."],
        AgentType::Editor => &["Checking brand voice...", "Reviewing for policy issues..."],
        AgentType::Scheduler => &["Analyzing audience activity...", "Selecting time slot..."],
        AgentType::Publisher => &["Connecting to platform...", "Uploading post..."],
        AgentType::Analyst => &["Collecting post metrics...", "Comparing with last week..."],
    }
}

fn canned_output(agent_type: AgentType, previous: Option<&str>) -> serde_json::Value {
    match agent_type {
        AgentType::Researcher => json!({
            "summary": "Short behind-the-scenes clips are outperforming polished ads this week.",
            "trends": ["behind the scenes", "day in the life", "quick tips"]
        }),
        AgentType::Strategist => json!({
            "angle": "Show the messy middle of making the product",
            "audience": "Early-career creators"
        }),
        AgentType::Writer => json!({
            "caption": previous
                .map(|p| format!("Here's what nobody shows you. ({})", first_line(p)))
                .unwrap_or_else(|| "Here's what nobody shows you.".to_string()),
            "hashtags": ["behindthescenes", "creatorlife", "buildinpublic"]
        }),
        AgentType::MediaCreator => json!({
            "imagePrompt": "Cluttered studio desk at golden hour, candid phone photo",
            "style": "warm film grain"
        }),
        AgentType::Editor => json!({
            "approved": true,
            "feedback": "Hook is strong; trimmed the second sentence."
        }),
        AgentType::Scheduler => json!({
            "scheduledTime": "18:30 local time",
            "reasoning": "Followers are most active right after work hours."
        }),
        AgentType::Publisher => json!({
            "platform": "instagram",
            "status": "published",
            "postUrl": "https://instagram.com/p/simulated"
        }),
        AgentType::Analyst => json!({
            "insights": ["Saves up 12%", "Reach flat"],
            "recommendation": "Post two more behind-the-scenes clips this week."
        }),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoProgress;
    use crate::formatter::format_node_result;
    use crate::models::{AccountContext, AiProvider};
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<String>>);

    impl ProgressReporter for Collect {
        fn status_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn request(node_type: AgentType) -> AgentRequest {
        AgentRequest {
            node_type,
            config: None,
            provider: AiProvider::Anthropic,
            previous_output: None,
            account_context: AccountContext::default(),
        }
    }

    #[tokio::test]
    async fn test_reports_lines_then_output() {
        let caller = SimulatedAgentCaller::new(Duration::ZERO);
        let progress = Collect(Mutex::new(Vec::new()));

        let response = caller.call(request(AgentType::Scheduler), &progress).await.unwrap();

        assert_eq!(progress.0.lock().unwrap().len(), 2);
        assert_eq!(
            format_node_result(AgentType::Scheduler, &response.output),
            "Scheduled for 18:30 local time\nFollowers are most active right after work hours."
        );
    }

    #[tokio::test]
    async fn test_every_type_formats() {
        let caller = SimulatedAgentCaller::new(Duration::ZERO);
        for agent_type in [
            AgentType::Researcher,
            AgentType::Strategist,
            AgentType::Writer,
            AgentType::MediaCreator,
            AgentType::Editor,
            AgentType::Scheduler,
            AgentType::Publisher,
            AgentType::Analyst,
        ] {
            let response = caller.call(request(agent_type), &NoProgress).await.unwrap();
            assert_ne!(format_node_result(agent_type, &response.output), response.output);
        }
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let caller = SimulatedAgentCaller::new(Duration::ZERO).fail_on(AgentType::Publisher, "rate limited");
        let err = caller.call(request(AgentType::Publisher), &NoProgress).await.unwrap_err();
        assert_eq!(err.to_string(), "rate limited");
    }
}
