//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
///
/// Only [`AgentError::Validation`] and the provider family are hard failures for a
/// caller. Tool failures are folded into the turn as outcomes, discovery failures
/// become warnings, and an exhausted iteration budget still returns content.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Bad request shape; the turn never starts
    #[error("Validation error: {0}")]
    Validation(String),

    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Rate limited by the provider
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication with the provider failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Tool server unreachable or returned an unusable tool list
    #[error("Tool discovery failed: {0}")]
    ToolDiscovery(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Requested tool is not in the registry
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Tool arguments could not be parsed or miss required fields
    #[error("Malformed tool arguments: {0}")]
    MalformedArguments(String),

    /// Maximum iterations reached in the agent loop
    #[error("Maximum iterations ({0}) reached")]
    IterationLimitExceeded(usize),

    /// Another turn holds this session
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// The caller went away before the turn finished
    #[error("Turn cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::RateLimited(_) | Self::SessionBusy(_) | Self::Io(_)
        )
    }

    /// Stable machine-readable code for API responses
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Auth(_) => "AUTH_ERROR",
            Self::ToolDiscovery(_) => "TOOL_DISCOVERY_ERROR",
            Self::ToolExecution(_) => "TOOL_EXECUTION_ERROR",
            Self::UnknownTool(_) => "UNKNOWN_TOOL",
            Self::MalformedArguments(_) => "MALFORMED_ARGUMENTS",
            Self::IterationLimitExceeded(_) => "ITERATION_LIMIT_EXCEEDED",
            Self::SessionBusy(_) => "SESSION_BUSY",
            Self::Cancelled => "CANCELLED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("Invalid request: {msg}"),
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) => "The AI service is currently unavailable. Please try again.".into(),
            Self::UnknownTool(name) => format!("The tool '{name}' is not available."),
            Self::MalformedArguments(msg) => format!("Invalid tool input: {msg}"),
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::ToolDiscovery(_) => "Tools are temporarily unavailable.".into(),
            Self::IterationLimitExceeded(_) => "The request took too long to process. Please try a simpler query.".into(),
            Self::SessionBusy(_) => "A previous message is still being processed. Please retry shortly.".into(),
            Self::RateLimited(_) => "You've made too many requests. Please wait a moment.".into(),
            Self::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AgentError::SessionBusy("s".into()).is_retryable());
        assert!(AgentError::RateLimited("slow down".into()).is_retryable());
        assert!(!AgentError::Validation("empty".into()).is_retryable());
        assert!(!AgentError::Provider("bad request".into()).is_retryable());
    }

    #[test]
    fn test_codes() {
        assert_eq!(AgentError::Validation(String::new()).code(), "VALIDATION_ERROR");
        assert_eq!(AgentError::SessionBusy(String::new()).code(), "SESSION_BUSY");
        assert_eq!(AgentError::Other(String::new()).code(), "INTERNAL_ERROR");
    }
}
