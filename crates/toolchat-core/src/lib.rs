//! # toolchat-core
//!
//! Provider-agnostic agent loop for tool-using chat, with per-user sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Orchestrator                             │
//! │  ┌──────────────┐   ┌──────────────────────────────────────────┐ │
//! │  │ SessionStore │   │                 Agent                    │ │
//! │  │ (per-session │──▶│  ┌─────────┐  ┌────────────┐  ┌────────┐ │ │
//! │  │   mutex)     │   │  │ Token   │  │   Tool     │  │  Llm   │ │ │
//! │  └──────────────┘   │  │ Budget  │──│  Registry  │──│Provider│ │ │
//! │         ▲           │  └─────────┘  └────────────┘  └────────┘ │ │
//! │   eviction task     └──────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between OpenAI, Anthropic, Gemini,
//! or any other provider without changing agent logic. Tools come from a
//! `ToolServer` the registry talks to.

pub mod agent;
pub mod budget;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod provider;
pub mod session;
pub mod stream;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::{Agent, AgentBuilder, AgentConfig, TurnEvent, TurnOutcome, TurnResult};
pub use budget::TokenBudget;
pub use error::{AgentError, Result};
pub use message::{ConversationTurn, Message, Role, ToolCallRequest};
pub use orchestrator::{ClearResponse, Orchestrator, OrchestratorConfig, TurnRequest, TurnResponse};
pub use provider::{FinishReason, GenerationOptions, LlmProvider, ModelResponse, TokenUsage};
pub use session::{BusyPolicy, Session, SessionConfig, SessionIdentity, SessionStore};
pub use stream::{ProviderEvent, SseDecoder, SseFrame};
pub use tool::{FailureKind, ToolDescriptor, ToolInvocation, ToolOutcome, ToolRegistry, ToolServer};
