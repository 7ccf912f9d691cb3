//! Server configuration, read from the environment at boot.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};

use crate::models::AiProvider;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMode {
    /// Forward agent calls to an HTTP agent service
    Http { endpoint: String },
    /// Answer agent calls locally with canned output
    Simulated { step_delay: Duration },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub agent_mode: AgentMode,
    pub provider: AiProvider,
    /// Key for `provider`, passed to the agent service with every call
    pub api_key: Option<String>,
    pub event_buffer: usize,
}

impl Config {
    /// Expected environment variables:
    /// - RUNNER_PORT (optional, default: 3000)
    /// - AGENT_MODE (optional, `http` or `simulated`, default: simulated)
    /// - AGENT_ENDPOINT (required when AGENT_MODE=http)
    /// - AI_PROVIDER (optional, `anthropic` or `openai`, default: anthropic)
    /// - ANTHROPIC_API_KEY / OPENAI_API_KEY (key for the chosen provider)
    /// - SIMULATED_STEP_MS (optional, default: 400)
    /// - EVENT_BUFFER (optional, default: 100)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let port = match lookup("RUNNER_PORT") {
            Some(v) => v.parse::<u16>().context("RUNNER_PORT must be a port number")?,
            None => 3000,
        };

        let provider = match lookup("AI_PROVIDER").as_deref() {
            None | Some("anthropic") => AiProvider::Anthropic,
            Some("openai") => AiProvider::OpenAi,
            Some(other) => bail!("Unknown AI_PROVIDER '{}'", other),
        };

        let key_var = match provider {
            AiProvider::Anthropic => "ANTHROPIC_API_KEY",
            AiProvider::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = lookup(key_var).filter(|k| !k.is_empty());

        let agent_mode = match lookup("AGENT_MODE").as_deref() {
            None | Some("simulated") => {
                let step_ms = match lookup("SIMULATED_STEP_MS") {
                    Some(v) => v
                        .parse::<u64>()
                        .context("SIMULATED_STEP_MS must be a number of milliseconds")?,
                    None => 400,
                };
                AgentMode::Simulated {
                    step_delay: Duration::from_millis(step_ms),
                }
            }
            Some("http") => {
                let endpoint = lookup("AGENT_ENDPOINT")
                    .ok_or_else(|| anyhow!("AGENT_ENDPOINT environment variable not set"))?;
                if api_key.is_none() {
                    tracing::warn!("{} not set. Agent calls will be sent without a key.", key_var);
                }
                AgentMode::Http { endpoint }
            }
            Some(other) => bail!("Unknown AGENT_MODE '{}'", other),
        };

        let event_buffer = match lookup("EVENT_BUFFER") {
            Some(v) => v.parse::<usize>().context("EVENT_BUFFER must be a positive integer")?,
            None => 100,
        };
        if event_buffer == 0 {
            bail!("EVENT_BUFFER must be greater than zero");
        }

        Ok(Config {
            port,
            agent_mode,
            provider,
            api_key,
            event_buffer,
        })
    }
}
