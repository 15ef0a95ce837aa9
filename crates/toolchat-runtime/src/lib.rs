//! # toolchat-runtime
//!
//! Model-provider adapters and the tool-server client for toolchat.
//!
//! ## Providers
//!
//! - **Anthropic** (default in the server): Messages API, streamed over SSE
//! - **OpenAI**: Chat Completions API
//! - **Gemini**: `generateContent`
//!
//! ## Tools
//!
//! - **MCP**: JSON-RPC over streamable HTTP, plugged into `ToolRegistry`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use toolchat_runtime::{AnthropicProvider, McpHttpClient, McpServerConfig};
//!
//! let provider = AnthropicProvider::from_env()?;
//! let tools = ToolRegistry::new(Arc::new(McpHttpClient::new(McpServerConfig::new(url))));
//! let agent = AgentBuilder::new()
//!     .provider(Arc::new(provider))
//!     .tools(Arc::new(tools))
//!     .build()?;
//! ```

mod http;

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "gemini")]
pub mod gemini;
#[cfg(feature = "mcp")]
pub mod mcp;
#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicConfig, AnthropicProvider};
#[cfg(feature = "gemini")]
pub use gemini::{GeminiConfig, GeminiProvider};
pub use http::DEFAULT_TIMEOUT_SECS;
#[cfg(feature = "mcp")]
pub use mcp::{DEFAULT_MCP_URL, McpHttpClient, McpServerConfig};
#[cfg(feature = "openai")]
pub use openai::{OpenAiConfig, OpenAiProvider};

// Re-export core types for convenience
pub use toolchat_core::{
    Agent, AgentBuilder, AgentError, LlmProvider, Message, Result, Role, ToolRegistry, ToolServer,
};
