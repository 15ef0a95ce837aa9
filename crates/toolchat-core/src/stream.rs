//! Streaming Events
//!
//! Providers that stream report a response as a sequence of typed [`ProviderEvent`]s.
//! [`SseDecoder`] turns raw `text/event-stream` bytes into whole frames, and
//! [`ResponseAssembler`] folds events back into a [`ModelResponse`]. Both only ever
//! act on complete units: a frame is not surfaced until its terminating blank line
//! arrives, and the assembler consumes whole events.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::ToolCallRequest;
use crate::provider::{FinishReason, ModelResponse, TokenUsage};

/// One incremental event from a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    MessageStart,
    ContentDelta { text: String },
    ToolCallStart { id: String, name: String },
    ToolInputDelta { id: String, partial_json: String },
    ToolCallEnd { id: String },
    MessageStop {
        finish_reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
    },
}

/// A complete server-sent-events frame
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, if present
    pub event: Option<String>,
    /// Joined `data:` lines
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Feed arbitrary byte chunks with [`SseDecoder::push`]; only frames whose blank-line
/// terminator has been seen are returned. Partial frames stay buffered, so a frame
/// split across network reads (including inside a multi-byte character) decodes
/// correctly once the rest arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every frame completed by them
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that ended without a blank line
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(&String::from_utf8_lossy(&rest))
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut has_data = false;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    frame.data.push('\n');
                }
                frame.data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }

    (has_data || frame.event.is_some()).then_some(frame)
}

#[derive(Debug)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds [`ProviderEvent`]s into a [`ModelResponse`]
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    text: String,
    tool_calls: Vec<PartialToolCall>,
    usage: Option<TokenUsage>,
    finish_reason: Option<FinishReason>,
    stopped: bool,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event
    pub fn apply(&mut self, event: &ProviderEvent) -> Result<()> {
        match event {
            ProviderEvent::MessageStart | ProviderEvent::ToolCallEnd { .. } => {}
            ProviderEvent::ContentDelta { text } => self.text.push_str(text),
            ProviderEvent::ToolCallStart { id, name } => {
                self.tool_calls.push(PartialToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });
            }
            ProviderEvent::ToolInputDelta { id, partial_json } => {
                let call = self
                    .tool_calls
                    .iter_mut()
                    .rev()
                    .find(|c| &c.id == id)
                    .ok_or_else(|| AgentError::Provider(format!("input delta for unknown tool call '{id}'")))?;
                call.arguments.push_str(partial_json);
            }
            ProviderEvent::MessageStop { finish_reason, usage } => {
                self.finish_reason.clone_from(finish_reason);
                self.usage.clone_from(usage);
                self.stopped = true;
            }
        }
        Ok(())
    }

    /// Whether `MessageStop` has been seen
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Build the response assembled so far
    pub fn finish(self) -> ModelResponse {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(|c| {
                let arguments = if c.arguments.trim().is_empty() { "{}".to_string() } else { c.arguments };
                ToolCallRequest::new(c.id, c.name, arguments)
            })
            .collect();

        ModelResponse {
            text: self.text,
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}
