//! HTTP plumbing shared by the adapters

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use toolchat_core::error::{AgentError, Result};

/// Default request timeout for model calls
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const MAX_ERROR_BODY: usize = 500;

pub(crate) fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Read a non-empty environment variable
pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn require_env(name: &str) -> Result<String> {
    env_var(name).ok_or_else(|| AgentError::Config(format!("{name} environment variable is required")))
}

/// Map a transport failure
pub(crate) fn transport_error(provider: &str, err: &reqwest::Error) -> AgentError {
    if err.is_connect() || err.is_timeout() {
        AgentError::ProviderUnavailable(format!("{provider}: {err}"))
    } else {
        AgentError::Provider(format!("{provider}: {err}"))
    }
}

/// Map a non-success HTTP status
pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> AgentError {
    let detail = error_detail(body);
    let message = format!("{provider} returned {status}: {detail}");
    match status.as_u16() {
        401 | 403 => AgentError::Auth(message),
        429 => AgentError::RateLimited(message),
        500..=599 => AgentError::ProviderUnavailable(message),
        _ => AgentError::Provider(message),
    }
}

/// Pass successful responses through, turn the rest into errors
pub(crate) async fn check_status(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(provider, status = status.as_u16(), "Provider request failed");
    Err(status_error(provider, status, &body))
}

/// `error.message` from the usual JSON error envelopes, else the raw body
fn error_detail(body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(serde_json::Value::as_str);

    match message {
        Some(message) => message.to_string(),
        None => body.chars().take(MAX_ERROR_BODY).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(status_error("p", StatusCode::UNAUTHORIZED, ""), AgentError::Auth(_)));
        assert!(matches!(status_error("p", StatusCode::FORBIDDEN, ""), AgentError::Auth(_)));
        assert!(matches!(status_error("p", StatusCode::TOO_MANY_REQUESTS, ""), AgentError::RateLimited(_)));
        assert!(matches!(
            status_error("p", StatusCode::SERVICE_UNAVAILABLE, ""),
            AgentError::ProviderUnavailable(_)
        ));
        assert!(matches!(status_error("p", StatusCode::BAD_REQUEST, ""), AgentError::Provider(_)));
    }

    #[test]
    fn test_error_detail_extracts_message() {
        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens: too large"}}"#;
        assert_eq!(error_detail(body), "max_tokens: too large");
        assert_eq!(error_detail("plain failure"), "plain failure");
    }
}
