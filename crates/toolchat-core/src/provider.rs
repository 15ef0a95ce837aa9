//! LLM Provider Strategy Pattern
//!
//! Defines the one capability the agent loop needs from a model backend:
//! `send(messages, tools) -> {text, tool_calls}`, optionally as a stream of typed
//! events. Each backend (OpenAI, Anthropic, Gemini, ...) implements it as a thin
//! adapter, so the iterate-until-no-tool-calls logic exists exactly once.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use toolchat_core::provider::{LlmProvider, GenerationOptions};
//!
//! let provider = AnthropicProvider::from_env()?;
//! let response = provider.send(&messages, &tools, &GenerationOptions::default()).await?;
//! ```

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Message, ToolCallRequest};
use crate::stream::ProviderEvent;
use crate::tool::ToolDescriptor;

/// Configuration for LLM generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier override; `None` uses the provider's configured model
    #[serde(default)]
    pub model: Option<String>,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

const fn default_max_tokens() -> u32 {
    4096
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(rhs.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(rhs.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(rhs.total_tokens);
    }
}

/// Reason for completion finishing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Other(String),
}

/// One model response: text plus any tool calls it requested
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Text output (may be empty when the model only calls tools)
    pub text: String,

    /// Tool calls, in the order the model emitted them
    pub tool_calls: Vec<ToolCallRequest>,

    /// Token usage statistics (if reported)
    pub usage: Option<TokenUsage>,

    /// Finish reason (if reported)
    pub finish_reason: Option<FinishReason>,
}

impl ModelResponse {
    /// Plain text response with no tool calls
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }
    }

    /// Replay this response as the event sequence a streaming provider would emit
    pub fn into_events(self) -> Vec<ProviderEvent> {
        let mut events = vec![ProviderEvent::MessageStart];
        if !self.text.is_empty() {
            events.push(ProviderEvent::ContentDelta { text: self.text });
        }
        for call in self.tool_calls {
            events.push(ProviderEvent::ToolCallStart {
                id: call.id.clone(),
                name: call.name,
            });
            events.push(ProviderEvent::ToolInputDelta {
                id: call.id.clone(),
                partial_json: call.arguments,
            });
            events.push(ProviderEvent::ToolCallEnd { id: call.id });
        }
        events.push(ProviderEvent::MessageStop {
            finish_reason: self.finish_reason,
            usage: self.usage,
        });
        events
    }
}

/// Stream type for incremental responses
pub type ProviderEventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The agent works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logs and health output
    fn name(&self) -> &str;

    /// Context window of the configured model, in tokens
    fn context_window(&self) -> u32;

    /// Send messages (system prompt first) with the tools the model may call.
    /// An empty tool slice means the model cannot request tools.
    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        options: &GenerationOptions,
    ) -> Result<ModelResponse>;

    /// Streaming variant of [`LlmProvider::send`].
    ///
    /// The default replays the buffered response as events; providers with native
    /// streaming override it.
    async fn send_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        options: &GenerationOptions,
    ) -> Result<ProviderEventStream> {
        let response = self.send(messages, tools, options).await?;
        let events = response.into_events().into_iter().map(Ok);
        Ok(Box::pin(futures::stream::iter(events)))
    }

    /// Minimal round trip to the provider
    async fn health_check(&self) -> Result<bool>;

    /// Estimate token count for text (provider-specific tokenization)
    fn estimate_tokens(&self, text: &str) -> u32 {
        // Default: ~4 chars per token, rounded up
        u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_options_defaults() {
        let opts = GenerationOptions::default();
        assert_eq!(opts.max_tokens, 4096);
        assert!(opts.model.is_none());
        assert!(opts.temperature.is_none());
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = TokenUsage::default();
        total += TokenUsage::new(100, 20);
        total += TokenUsage::new(150, 30);
        assert_eq!(total, TokenUsage { prompt_tokens: 250, completion_tokens: 50, total_tokens: 300 });
    }

    #[test]
    fn test_into_events_round_trips_through_assembler() {
        let response = ModelResponse {
            text: "checking".into(),
            tool_calls: vec![ToolCallRequest::new("c1", "getClan", r##"{"tag":"#ABC"}"##)],
            usage: None,
            finish_reason: Some(FinishReason::ToolUse),
        };

        let mut assembler = crate::stream::ResponseAssembler::new();
        for event in response.clone().into_events() {
            assembler.apply(&event).unwrap();
        }
        let rebuilt = assembler.finish();
        assert_eq!(rebuilt.text, response.text);
        assert_eq!(rebuilt.tool_calls, response.tool_calls);
    }
}
