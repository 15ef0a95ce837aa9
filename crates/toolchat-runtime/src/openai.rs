//! OpenAI LLM Provider
//!
//! Implementation of `LlmProvider` over the chat completions API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolchat_core::{
    error::{AgentError, Result},
    message::{Message, Role, ToolCallRequest},
    provider::{FinishReason, GenerationOptions, LlmProvider, ModelResponse, TokenUsage},
    tool::ToolDescriptor,
};

use crate::http::{self, DEFAULT_TIMEOUT_SECS};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

/// OpenAI provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub context_window: u32,
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            base_url: DEFAULT_BASE_URL.into(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// `OPENAI_API_KEY` (required), `OPENAI_MODEL_NAME`, `OPENAI_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(http::require_env("OPENAI_API_KEY")?);
        if let Some(model) = http::env_var("OPENAI_MODEL_NAME") {
            config.model = model;
        }
        if let Some(base_url) = http::env_var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// OpenAI LLM provider
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn from_config(config: OpenAiConfig) -> Self {
        Self {
            client: http::build_client(Duration::from_secs(config.timeout_secs)),
            config,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::from_config(OpenAiConfig::from_env()?))
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        max_tokens: u32,
        options: &GenerationOptions,
    ) -> ChatRequest {
        let tools: Vec<Value> = tools.iter().map(ToolDescriptor::to_openai_function).collect();
        ChatRequest {
            model: options.model.clone().unwrap_or_else(|| self.config.model.clone()),
            messages: convert_messages(messages),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            tools,
            max_tokens,
            temperature: options.temperature,
        }
    }

    async fn post(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| http::transport_error(PROVIDER, &e))?;

        http::check_status(PROVIDER, response)
            .await?
            .json::<ChatResponse>()
            .await
            .map_err(|e| AgentError::Provider(format!("{PROVIDER}: invalid response body: {e}")))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn context_window(&self) -> u32 {
        self.config.context_window
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        options: &GenerationOptions,
    ) -> Result<ModelResponse> {
        let request = self.build_request(messages, tools, options.max_tokens, options);
        let response = self.post(&request).await?;
        convert_response(response)
    }

    async fn health_check(&self) -> Result<bool> {
        let request = self.build_request(&[Message::user("test")], &[], 1, &GenerationOptions::default());
        match self.post(&request).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("OpenAI health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// Conversion

fn convert_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Assistant if m.has_tool_calls() => ChatMessage {
                role: "assistant".into(),
                content: (!m.content.is_empty()).then(|| m.content.clone()),
                tool_calls: m
                    .tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: c.id.clone(),
                        call_type: function_type(),
                        function: WireFunction {
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        },
                    })
                    .collect(),
                tool_call_id: None,
            },
            Role::Tool => ChatMessage {
                role: "tool".into(),
                content: Some(m.content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: m.tool_call_id.clone(),
            },
            role => ChatMessage {
                role: role.as_str().into(),
                content: Some(m.content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
        })
        .collect()
}

fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn convert_response(response: ChatResponse) -> Result<ModelResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Provider(format!("{PROVIDER}: response has no choices")))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| ToolCallRequest::new(c.id, c.function.name, c.function.arguments))
        .collect();

    Ok(ModelResponse {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        finish_reason: choice.finish_reason.as_deref().map(convert_finish_reason),
    })
}
