//! Anthropic LLM Provider
//!
//! Implementation of `LlmProvider` over the messages API, with native SSE streaming.
//! Stream frames are decoded by [`SseDecoder`] and translated one at a time into
//! [`ProviderEvent`]s.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use toolchat_core::{
    error::{AgentError, Result},
    message::{Message, Role, ToolCallRequest},
    provider::{FinishReason, GenerationOptions, LlmProvider, ModelResponse, ProviderEventStream, TokenUsage},
    stream::{ProviderEvent, SseDecoder, SseFrame},
    tool::ToolDescriptor,
};

use crate::http::{self, DEFAULT_TIMEOUT_SECS};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_CONTEXT_WINDOW: u32 = 200_000;
const ANTHROPIC_VERSION: &str = "2023-06-01";
const STREAM_BUFFER: usize = 32;

/// Anthropic provider configuration
#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub context_window: u32,
    pub timeout_secs: u64,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            base_url: DEFAULT_BASE_URL.into(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// `ANTHROPIC_API_KEY` (required), `CLAUDE_MODEL_NAME`, `ANTHROPIC_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(http::require_env("ANTHROPIC_API_KEY")?);
        if let Some(model) = http::env_var("CLAUDE_MODEL_NAME") {
            config.model = model;
        }
        if let Some(base_url) = http::env_var("ANTHROPIC_BASE_URL") {
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

/// Anthropic (Claude) LLM provider
pub struct AnthropicProvider {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn from_config(config: AnthropicConfig) -> Self {
        Self {
            client: http::build_client(Duration::from_secs(config.timeout_secs)),
            config,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::from_config(AnthropicConfig::from_env()?))
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        max_tokens: u32,
        options: &GenerationOptions,
        stream: bool,
    ) -> MessagesRequest {
        let (system, messages) = convert_messages(messages);
        MessagesRequest {
            model: options.model.clone().unwrap_or_else(|| self.config.model.clone()),
            max_tokens,
            system,
            messages,
            tools: tools.iter().map(ToolDescriptor::to_anthropic_tool).collect(),
            temperature: options.temperature,
            stream: stream.then_some(true),
        }
    }

    async fn post(&self, request: &MessagesRequest) -> Result<reqwest::Response> {
        let url = format!("{}/messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| http::transport_error(PROVIDER, &e))?;
        http::check_status(PROVIDER, response).await
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
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
        let request = self.build_request(messages, tools, options.max_tokens, options, false);
        let response: MessagesResponse = self
            .post(&request)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("{PROVIDER}: invalid response body: {e}")))?;
        Ok(convert_response(response))
    }

    async fn send_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        options: &GenerationOptions,
    ) -> Result<ProviderEventStream> {
        let request = self.build_request(messages, tools, options.max_tokens, options, true);
        let response = self.post(&request).await?;

        let (tx, rx) = mpsc::channel::<Result<ProviderEvent>>(STREAM_BUFFER);
        let bytes = response.bytes_stream();

        tokio::spawn(async move {
            tokio::pin!(bytes);
            let mut decoder = SseDecoder::new();
            let mut translator = StreamTranslator::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(http::transport_error(PROVIDER, &e))).await;
                        return;
                    }
                };

                for frame in decoder.push(&chunk) {
                    match translator.on_frame(&frame) {
                        Ok(events) => {
                            for event in events {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                    if translator.stopped {
                        return;
                    }
                }
            }

            if let Some(frame) = decoder.finish() {
                if let Ok(events) = translator.on_frame(&frame) {
                    for event in events {
                        let _ = tx.send(Ok(event)).await;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> Result<bool> {
        let request = self.build_request(&[Message::user("test")], &[], 1, &GenerationOptions::default(), false);
        match self.post(&request).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Anthropic health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Stateful mapping from Anthropic stream frames to provider events
#[derive(Debug, Default)]
struct StreamTranslator {
    tool_blocks: HashMap<u32, String>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
    stopped: bool,
}

impl StreamTranslator {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<ProviderEvent>> {
        if frame.data.is_empty() {
            return Ok(Vec::new());
        }
        let event: StreamEvent = serde_json::from_str(&frame.data)
            .map_err(|e| AgentError::Provider(format!("{PROVIDER}: malformed stream event: {e}")))?;

        let events = match event {
            StreamEvent::MessageStart { message } => {
                if let Some(tokens) = message.usage.and_then(|u| u.input_tokens) {
                    self.input_tokens = tokens;
                }
                vec![ProviderEvent::MessageStart]
            }
            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    self.tool_blocks.insert(index, id.clone());
                    vec![ProviderEvent::ToolCallStart { id, name }]
                }
                ContentBlock::Text { text } if !text.is_empty() => vec![ProviderEvent::ContentDelta { text }],
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![ProviderEvent::ContentDelta { text }],
                BlockDelta::InputJsonDelta { partial_json } => match self.tool_blocks.get(&index) {
                    Some(id) => vec![ProviderEvent::ToolInputDelta {
                        id: id.clone(),
                        partial_json,
                    }],
                    None => {
                        return Err(AgentError::Provider(format!(
                            "{PROVIDER}: input delta for block {index} with no tool call"
                        )));
                    }
                },
                BlockDelta::Other => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => match self.tool_blocks.remove(&index) {
                Some(id) => vec![ProviderEvent::ToolCallEnd { id }],
                None => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(tokens) = usage.and_then(|u| u.output_tokens) {
                    self.output_tokens = tokens;
                }
                Vec::new()
            }
            StreamEvent::MessageStop => {
                self.stopped = true;
                vec![ProviderEvent::MessageStop {
                    finish_reason: self.stop_reason.as_deref().map(convert_stop_reason),
                    usage: Some(TokenUsage::new(self.input_tokens, self.output_tokens)),
                }]
            }
            StreamEvent::Error { error } => {
                let message = format!("{PROVIDER} stream error ({}): {}", error.kind, error.message);
                return Err(if error.kind == "overloaded_error" {
                    AgentError::ProviderUnavailable(message)
                } else {
                    AgentError::Provider(message)
                });
            }
            StreamEvent::Ping | StreamEvent::Unknown => Vec::new(),
        };
        Ok(events)
    }
}

// Conversion

/// Split off the system prompt and group consecutive tool results into one user turn
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<WireMessage>) {
    let mut system: Vec<&str> = Vec::new();
    let mut wire: Vec<WireMessage> = Vec::new();
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    let flush = |wire: &mut Vec<WireMessage>, pending: &mut Vec<ContentBlock>| {
        if !pending.is_empty() {
            wire.push(WireMessage {
                role: "user",
                content: std::mem::take(pending),
            });
        }
    };

    for m in messages {
        match m.role {
            Role::System => system.push(&m.content),
            Role::Tool => pending_results.push(ContentBlock::ToolResult {
                tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                content: m.content.clone(),
            }),
            Role::User => {
                flush(&mut wire, &mut pending_results);
                wire.push(WireMessage {
                    role: "user",
                    content: vec![ContentBlock::Text { text: m.content.clone() }],
                });
            }
            Role::Assistant => {
                flush(&mut wire, &mut pending_results);
                let mut content = Vec::new();
                if !m.content.trim().is_empty() {
                    content.push(ContentBlock::Text { text: m.content.clone() });
                }
                for call in &m.tool_calls {
                    content.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments_value(),
                    });
                }
                // The API rejects empty assistant turns
                if !content.is_empty() {
                    wire.push(WireMessage {
                        role: "assistant",
                        content,
                    });
                }
            }
        }
    }
    flush(&mut wire, &mut pending_results);

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, wire)
}

fn convert_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolUse,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn convert_response(response: MessagesResponse) -> ModelResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            ContentBlock::Text { text: chunk } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&chunk);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCallRequest::new(id, name, input.to_string()));
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Unsupported => {}
        }
    }

    let usage = response.usage.map(|u| {
        TokenUsage::new(u.input_tokens.unwrap_or_default(), u.output_tokens.unwrap_or_default())
    });

    ModelResponse {
        text,
        tool_calls,
        usage,
        finish_reason: response.stop_reason.as_deref().map(convert_stop_reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolchat_core::stream::ResponseAssembler;

    fn frame(data: Value) -> SseFrame {
        SseFrame {
            event: data["type"].as_str().map(str::to_string),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_convert_messages_groups_tool_results() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("compare two players"),
            Message::assistant_with_tool_calls(
                "Looking up both.",
                vec![
                    ToolCallRequest::new("tu_1", "getPlayer", r#"{"id":"A"}"#),
                    ToolCallRequest::new("tu_2", "getPlayer", r#"{"id":"B"}"#),
                ],
            ),
            Message::tool("{}", "tu_1", "getPlayer"),
            Message::tool("Error: timeout", "tu_2", "getPlayer"),
        ];
        let (system, wire) = convert_messages(&messages);
        let wire = serde_json::to_value(wire).unwrap();

        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(wire.as_array().unwrap().len(), 3);
        assert_eq!(wire[1]["content"][0]["type"], "text");
        assert_eq!(wire[1]["content"][1]["input"]["id"], "A");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(wire[2]["content"][1]["tool_use_id"], "tu_2");
    }

    #[test]
    fn test_convert_messages_skips_empty_assistant() {
        let messages = vec![Message::user("a"), Message::assistant(""), Message::user("b")];
        let (_, wire) = convert_messages(&messages);
        assert_eq!(wire.len(), 2);
    }

    #[test]
    fn test_convert_response() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "tu_1", "name": "getClan", "input": {"tag": "#X"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 30, "output_tokens": 9}
        }))
        .unwrap();

        let converted = convert_response(response);
        assert_eq!(converted.text, "Checking.");
        assert_eq!(converted.tool_calls[0].arguments, r##"{"tag":"#X"}"##);
        assert_eq!(converted.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(converted.usage, Some(TokenUsage::new(30, 9)));
    }

    #[test]
    fn test_stream_translation_assembles_tool_call() {
        let frames = [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 25}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Let me look."}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "ping"}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "tu_9", "name": "getPlayer", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"id\":"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"ABC\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 14}}),
            json!({"type": "message_stop"}),
        ];

        let mut translator = StreamTranslator::default();
        let mut assembler = ResponseAssembler::new();
        for data in frames {
            for event in translator.on_frame(&frame(data)).unwrap() {
                assembler.apply(&event).unwrap();
            }
        }
        assert!(translator.stopped);

        let response = assembler.finish();
        assert_eq!(response.text, "Let me look.");
        assert_eq!(response.tool_calls, vec![ToolCallRequest::new("tu_9", "getPlayer", r#"{"id":"ABC"}"#)]);
        assert_eq!(response.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(response.usage, Some(TokenUsage::new(25, 14)));
    }

    #[test]
    fn test_stream_error_event() {
        let mut translator = StreamTranslator::default();
        let err = translator
            .on_frame(&frame(json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})))
            .unwrap_err();
        assert!(matches!(err, AgentError::ProviderUnavailable(_)));
    }

    #[test]
    fn test_unknown_stream_events_are_ignored() {
        let mut translator = StreamTranslator::default();
        let events = translator
            .on_frame(&frame(json!({"type": "something_new", "index": 3})))
            .unwrap();
        assert!(events.is_empty());
    }
}
