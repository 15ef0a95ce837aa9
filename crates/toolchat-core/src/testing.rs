//! Scripted doubles for tests
//!
//! [`ScriptedProvider`] replays canned model responses and records what it was sent;
//! [`ScriptedToolServer`] serves fixed tool descriptors with per-tool behavior.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::message::{Message, ToolCallRequest};
use crate::provider::{FinishReason, GenerationOptions, LlmProvider, ModelResponse};
use crate::tool::{ToolDescriptor, ToolServer};

/// Provider that answers from a script
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ModelResponse>>>,
    repeat: Option<ModelResponse>,
    calls: Mutex<Vec<Vec<Message>>>,
    tools_seen: Mutex<Vec<usize>>,
    delay: Option<Duration>,
    context_window: u32,
    healthy: AtomicBool,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            calls: Mutex::new(Vec::new()),
            tools_seen: Mutex::new(Vec::new()),
            delay: None,
            context_window: 128_000,
            healthy: AtomicBool::new(true),
        }
    }
}

impl ScriptedProvider {
    /// Replay `responses` in order, then fail
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    /// Answer every call with the same response
    pub fn repeating(response: ModelResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::default()
        }
    }

    /// Queue a provider error as the next answer
    #[must_use]
    pub fn then_error(self, err: AgentError) -> Self {
        self.lock_script().push_back(Err(err));
        self
    }

    /// Sleep before every answer
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub const fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of `send` calls so far
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Messages passed to every call, in order
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of tools offered on each call
    pub fn tools_seen(&self) -> Vec<usize> {
        self.tools_seen.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ModelResponse>>> {
        self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Response that requests one tool call
pub fn tool_call_response(id: &str, name: &str, arguments: Value) -> ModelResponse {
    ModelResponse {
        text: String::new(),
        tool_calls: vec![ToolCallRequest::new(id, name, arguments.to_string())],
        usage: None,
        finish_reason: Some(FinishReason::ToolUse),
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        _options: &GenerationOptions,
    ) -> Result<ModelResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        if let Ok(mut seen) = self.tools_seen.lock() {
            seen.push(tools.len());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(response) = &self.repeat {
            return Ok(response.clone());
        }
        self.lock_script()
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::Provider("script exhausted".into())))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

/// How a scripted tool behaves when called
#[derive(Clone, Debug)]
pub enum ToolBehavior {
    /// Return this payload
    Return(Value),
    /// Fail with this message
    Fail(String),
    /// Never answer
    Hang,
}

/// Tool server with fixed tools
#[derive(Default)]
pub struct ScriptedToolServer {
    tools: Vec<ToolDescriptor>,
    behaviors: HashMap<String, ToolBehavior>,
    fail_discovery: AtomicBool,
    list_calls: AtomicUsize,
    invocations: Mutex<Vec<(String, Value)>>,
}

impl ScriptedToolServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool with an open object schema
    #[must_use]
    pub fn tool(self, name: &str, behavior: ToolBehavior) -> Self {
        self.tool_with_schema(name, serde_json::json!({"type": "object", "properties": {}}), behavior)
    }

    #[must_use]
    pub fn tool_with_schema(mut self, name: &str, schema: Value, behavior: ToolBehavior) -> Self {
        self.tools
            .push(ToolDescriptor::new(name, format!("Scripted tool {name}"), schema));
        self.behaviors.insert(name.to_string(), behavior);
        self
    }

    /// Make `list_tools` fail until cleared
    pub fn set_discovery_failure(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Every `(name, arguments)` the server received
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ToolServer for ScriptedToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(AgentError::ToolDiscovery("tool server unreachable".into()));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push((name.to_string(), arguments));
        }
        match self.behaviors.get(name) {
            Some(ToolBehavior::Return(payload)) => Ok(payload.clone()),
            Some(ToolBehavior::Fail(message)) => Err(AgentError::ToolExecution(message.clone())),
            Some(ToolBehavior::Hang) => {
                std::future::pending::<()>().await;
                Err(AgentError::ToolExecution(format!("{name} never answered")))
            }
            None => Err(AgentError::UnknownTool(name.to_string())),
        }
    }
}
