//! Agent Loop
//!
//! Drives one user turn: call the model, execute any tool calls it makes, feed the
//! outcomes back, and repeat until the model answers without tools or the iteration
//! budget runs out. Written once against [`LlmProvider`]; every backend shares it.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::budget::{DEFAULT_RESPONSE_RESERVE, TokenBudget};
use crate::error::{AgentError, Result};
use crate::message::{Message, Role, ToolCallRequest};
use crate::provider::{GenerationOptions, LlmProvider, ModelResponse, TokenUsage};
use crate::stream::{ProviderEvent, ResponseAssembler};
use crate::tool::{FailureKind, ToolDescriptor, ToolOutcome, ToolRegistry};

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// System prompt sent first on every model call
    pub system_prompt: String,

    /// Maximum provider calls per turn
    pub max_iterations: usize,

    /// Generation options
    pub generation: GenerationOptions,

    /// Context window override; `None` uses the provider's
    pub context_window: Option<u32>,

    /// Tokens reserved for the model's reply
    pub response_reserve: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            generation: GenerationOptions::default(),
            context_window: None,
            response_reserve: DEFAULT_RESPONSE_RESERVE,
        }
    }
}

/// Default cap on provider calls per turn
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to external tools. \
Use them when they help answer the question, then answer clearly and concisely. \
Use markdown formatting when appropriate.";

const ITERATION_LIMIT_NOTE: &str =
    "I wasn't able to finish this request within the allowed number of steps. Please try a simpler or more specific question.";

/// Result of one turn
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TurnResult {
    /// Final answer text
    pub content: String,

    /// Every tool call made during the turn, in order
    pub tool_outcomes: Vec<ToolOutcome>,

    /// Provider calls made
    pub iterations: usize,

    /// The iteration limit was hit before the model finished
    pub truncated: bool,

    /// Token usage summed over provider calls that reported it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// Degradations that did not fail the turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A finished turn plus the history to persist
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub result: TurnResult,

    /// Prior history followed by every turn produced here
    pub history: Vec<Message>,
}

/// Incremental progress of a turn, as sent to streaming clients
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    MessageStart {
        conversation_id: String,
    },
    ContentDelta {
        delta: String,
    },
    ToolUseStart {
        id: String,
        name: String,
    },
    ToolInputDelta {
        id: String,
        partial_json: String,
    },
    ToolResult {
        outcome: ToolOutcome,
    },
    MessageStop {
        conversation_id: String,
        #[serde(flatten)]
        result: TurnResult,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl TurnEvent {
    /// Event name, matching the serialized `type` tag
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentDelta { .. } => "content_delta",
            Self::ToolUseStart { .. } => "tool_use_start",
            Self::ToolInputDelta { .. } => "tool_input_delta",
            Self::ToolResult { .. } => "tool_result",
            Self::MessageStop { .. } => "message_stop",
            Self::Error { .. } => "error",
        }
    }

    pub fn from_error(err: &AgentError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.user_message(),
            retryable: err.is_retryable(),
        }
    }
}

/// The agent: a provider, the tool registry and loop settings
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self { provider, tools, config }
    }

    /// Run one turn on top of `history`
    pub async fn run_turn(&self, history: &[Message], user_message: &str) -> Result<TurnOutcome> {
        self.drive(history, user_message, None).await
    }

    /// Run one turn, forwarding deltas and tool results to `events` as they happen.
    ///
    /// If the receiver is dropped the turn ends with [`AgentError::Cancelled`] at the
    /// next model call; tool calls already started run to completion.
    pub async fn run_turn_streaming(
        &self,
        history: &[Message],
        user_message: &str,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<TurnOutcome> {
        self.drive(history, user_message, Some(events)).await
    }

    /// Minimal provider round trip
    pub async fn health_check(&self) -> Result<bool> {
        self.provider.health_check().await
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn budget(&self) -> TokenBudget {
        TokenBudget::new(
            self.config.context_window.unwrap_or_else(|| self.provider.context_window()),
            self.config.response_reserve,
        )
    }

    async fn drive(
        &self,
        history: &[Message],
        user_message: &str,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnOutcome> {
        let system = Message::system(&self.config.system_prompt);
        let budget = self.budget();
        let mut warnings = Vec::new();

        let tools = match self.tools.discover().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(error = %e, "Tool discovery failed, continuing without tools");
                warnings.push(e.to_string());
                Arc::from(Vec::new())
            }
        };

        let mut produced = vec![Message::user(user_message)];
        let mut fragments: Vec<String> = Vec::new();
        let mut outcomes: Vec<ToolOutcome> = Vec::new();
        let mut usage: Option<TokenUsage> = None;
        let mut iterations = 0;
        let mut truncated = false;

        loop {
            if events.is_some_and(mpsc::Sender::is_closed) {
                tracing::info!(iterations, "Client went away, cancelling turn");
                return Err(AgentError::Cancelled);
            }

            let kept = budget.fit_pinned(&system, history, &produced, |text| self.provider.estimate_tokens(text));
            let mut outbound = Vec::with_capacity(1 + kept.len() + produced.len());
            outbound.push(system.clone());
            outbound.extend(kept);
            outbound.extend(produced.iter().cloned());

            iterations += 1;
            tracing::debug!(iteration = iterations, messages = outbound.len(), tools = tools.len(), "Calling model");
            let response = self.call_model(&outbound, &tools, events).await?;

            if let Some(reported) = response.usage {
                *usage.get_or_insert_with(TokenUsage::default) += reported;
            }
            if !response.text.trim().is_empty() {
                fragments.push(response.text.clone());
            }

            if response.tool_calls.is_empty() {
                produced.push(Message::assistant(response.text));
                break;
            }

            produced.push(Message::assistant_with_tool_calls(
                response.text,
                response.tool_calls.clone(),
            ));

            for outcome in self.execute_tools(response.tool_calls).await {
                produced.push(Message::tool(
                    outcome.to_message_content(),
                    outcome.request_id(),
                    outcome.tool_name(),
                ));
                if let Some(tx) = events {
                    let _ = tx.send(TurnEvent::ToolResult { outcome: outcome.clone() }).await;
                }
                outcomes.push(outcome);
            }

            if iterations >= self.config.max_iterations {
                let err = AgentError::IterationLimitExceeded(self.config.max_iterations);
                tracing::warn!(iterations, "{err}, returning partial answer");
                warnings.push(err.to_string());
                truncated = true;
                break;
            }
        }

        // Answer text already lives in the assistant turns it came from; only the
        // filler is written into history.
        let mut content = fragments.join("\n\n");
        let mut filler = None;
        if content.trim().is_empty() {
            if let Some(summary) = fallback_summary(&outcomes) {
                tracing::warn!(tools = outcomes.len(), "No answer text but tools succeeded, using fallback summary");
                filler = Some(summary);
            } else if truncated {
                filler = Some(ITERATION_LIMIT_NOTE.to_string());
            }
            if let Some(filler) = &filler {
                content.clone_from(filler);
            }
        }

        if truncated {
            produced.push(Message::assistant(
                filler.unwrap_or_else(|| ITERATION_LIMIT_NOTE.to_string()),
            ));
        } else if let (Some(last), Some(filler)) = (produced.last_mut(), filler) {
            if last.role == Role::Assistant && last.content.trim().is_empty() {
                last.content = filler;
            }
        }

        tracing::info!(
            iterations,
            tool_calls = outcomes.len(),
            tool_failures = outcomes.iter().filter(|o| !o.is_success()).count(),
            truncated,
            content_len = content.len(),
            "Turn completed"
        );

        let mut full_history = Vec::with_capacity(history.len() + produced.len());
        full_history.extend_from_slice(history);
        full_history.extend(produced);

        Ok(TurnOutcome {
            result: TurnResult {
                content,
                tool_outcomes: outcomes,
                iterations,
                truncated,
                usage,
                warnings,
            },
            history: full_history,
        })
    }

    async fn call_model(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<ModelResponse> {
        let Some(tx) = events else {
            return self.provider.send(messages, tools, &self.config.generation).await;
        };

        let mut stream = self.provider.send_stream(messages, tools, &self.config.generation).await?;
        let mut assembler = ResponseAssembler::new();

        while let Some(event) = stream.next().await {
            let event = event?;
            assembler.apply(&event)?;

            let forwarded = match event {
                ProviderEvent::ContentDelta { text } => Some(TurnEvent::ContentDelta { delta: text }),
                ProviderEvent::ToolCallStart { id, name } => Some(TurnEvent::ToolUseStart { id, name }),
                ProviderEvent::ToolInputDelta { id, partial_json } => {
                    Some(TurnEvent::ToolInputDelta { id, partial_json })
                }
                _ => None,
            };
            if let Some(forwarded) = forwarded {
                if tx.send(forwarded).await.is_err() {
                    return Err(AgentError::Cancelled);
                }
            }

            if assembler.is_stopped() {
                break;
            }
        }

        if !assembler.is_stopped() {
            return Err(AgentError::Provider("stream ended before message_stop".into()));
        }
        Ok(assembler.finish())
    }

    /// Run the calls on their own tasks, returning outcomes in call order
    async fn execute_tools(&self, calls: Vec<ToolCallRequest>) -> Vec<ToolOutcome> {
        let handles: Vec<_> = calls
            .into_iter()
            .map(|call| {
                let registry = Arc::clone(&self.tools);
                tracing::debug!(tool = %call.name, request_id = %call.id, "Executing tool");
                let labels = (call.id.clone(), call.name.clone());
                let handle = tokio::spawn(async move { registry.execute(&call).await });
                (labels, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for ((request_id, tool_name), handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| ToolOutcome::Failure {
                request_id,
                tool_name,
                kind: FailureKind::Execution,
                error: format!("tool task failed: {e}"),
            });
            outcomes.push(outcome);
        }
        outcomes
    }
}

fn fallback_summary(outcomes: &[ToolOutcome]) -> Option<String> {
    let succeeded: Vec<&str> = outcomes
        .iter()
        .filter(|o| o.is_success())
        .map(ToolOutcome::tool_name)
        .collect();
    if succeeded.is_empty() {
        return None;
    }

    let mut summary = String::from("I've gathered some information for you using the available tools:\n\n");
    for name in succeeded {
        summary.push_str(&format!("**{name}**: Data retrieved successfully.\n"));
    }
    summary.push_str("\nLet me know if you'd like me to analyze this data further.");
    Some(summary)
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Option<Arc<ToolRegistry>>,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: None,
            config: AgentConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn context_window(mut self, tokens: u32) -> Self {
        self.config.context_window = Some(tokens);
        self
    }

    pub fn response_reserve(mut self, tokens: u32) -> Self {
        self.config.response_reserve = tokens;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }
        let tools = self.tools.unwrap_or_else(|| Arc::new(ToolRegistry::disabled()));

        Ok(Agent::new(provider, tools, self.config))
    }
}
