//! Server Configuration
//!
//! Everything is read from the environment (after `.env` is loaded).

use std::str::FromStr;
use std::time::Duration;

use toolchat_core::{
    agent::DEFAULT_MAX_ITERATIONS,
    budget::DEFAULT_RESPONSE_RESERVE,
    orchestrator::DEFAULT_MAX_MESSAGE_CHARS,
    AgentError, BusyPolicy, Result, SessionConfig,
};
use toolchat_runtime::DEFAULT_MCP_URL;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";

/// Which model provider backs the agent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    #[default]
    Anthropic,
    Gemini,
}

impl FromStr for ProviderKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(AgentError::Config(format!("unknown LLM_PROVIDER '{other}'"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub provider: ProviderKind,
    /// `None` disables tools
    pub mcp_url: Option<String>,
    pub mcp_auth_token: Option<String>,
    pub system_prompt: Option<String>,
    pub max_iterations: usize,
    pub context_window: Option<u32>,
    pub response_reserve: u32,
    pub max_message_chars: usize,
    pub busy_policy: BusyPolicy,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.into(),
            provider: ProviderKind::default(),
            mcp_url: Some(DEFAULT_MCP_URL.into()),
            mcp_auth_token: None,
            system_prompt: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            context_window: None,
            response_reserve: DEFAULT_RESPONSE_RESERVE,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            busy_policy: BusyPolicy::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset and blank values fall back to defaults.
    /// `MCP_SERVER_URL` set to an empty string disables tools.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(addr) = get("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(provider) = get("LLM_PROVIDER") {
            config.provider = provider.parse()?;
        }
        config.mcp_url = match lookup("MCP_SERVER_URL") {
            Some(url) if url.trim().is_empty() => None,
            Some(url) => Some(url.trim().to_string()),
            None => Some(DEFAULT_MCP_URL.into()),
        };
        config.mcp_auth_token = get("MCP_AUTH_TOKEN");
        config.system_prompt = get("SYSTEM_PROMPT");

        if let Some(max) = get("MAX_ITERATIONS") {
            config.max_iterations = parse_number("MAX_ITERATIONS", &max)?;
        }
        if let Some(window) = get("CONTEXT_WINDOW") {
            config.context_window = Some(parse_number("CONTEXT_WINDOW", &window)?);
        }
        if let Some(reserve) = get("RESPONSE_RESERVE") {
            config.response_reserve = parse_number("RESPONSE_RESERVE", &reserve)?;
        }
        if let Some(chars) = get("MAX_MESSAGE_CHARS") {
            config.max_message_chars = parse_number("MAX_MESSAGE_CHARS", &chars)?;
        }
        if let Some(secs) = get("SESSION_TIMEOUT_SECS") {
            config.session.idle_timeout = Duration::from_secs(parse_number("SESSION_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = get("SESSION_SWEEP_SECS") {
            let secs: u64 = parse_number("SESSION_SWEEP_SECS", &secs)?;
            if secs == 0 {
                return Err(AgentError::Config("SESSION_SWEEP_SECS must be positive".into()));
            }
            config.session.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = get("SESSION_BUSY_POLICY") {
            config.busy_policy = BusyPolicy::from_str(&policy)?;
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| AgentError::Config(format!("{name} must be a number, got '{value}'")))
}
