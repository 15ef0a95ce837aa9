//! MCP Client over streamable HTTP
//!
//! Implements `ToolServer` with JSON-RPC 2.0 against a single endpoint. The
//! handshake (`initialize` then `notifications/initialized`) runs once on first
//! use; the `Mcp-Session-Id` the server hands out is sent on every later request.
//! Responses may come back as plain JSON or as a `text/event-stream` body.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use toolchat_core::{
    error::{AgentError, Result},
    stream::SseDecoder,
    tool::{ToolDescriptor, ToolServer},
};

use crate::http;

/// Default tool-server endpoint
pub const DEFAULT_MCP_URL: &str = "http://localhost:8000/mcp";

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";
const ACCEPT: &str = "application/json, text/event-stream";

/// MCP server configuration
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

impl McpServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            timeout_secs: 60,
        }
    }

    #[must_use]
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<McpTool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(default)]
    structured_content: Option<Value>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// JSON-RPC client for one MCP server
pub struct McpHttpClient {
    client: Client,
    config: McpServerConfig,
    next_id: AtomicU64,
    session_id: RwLock<Option<String>>,
    initialized: OnceCell<()>,
}

impl McpHttpClient {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            client: http::build_client(Duration::from_secs(config.timeout_secs)),
            config,
            next_id: AtomicU64::new(1),
            session_id: RwLock::new(None),
            initialized: OnceCell::new(),
        }
    }

    /// Run the handshake if it has not succeeded yet. A failed handshake is retried
    /// on the next call.
    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let result = self
                    .request(
                        "initialize",
                        json!({
                            "protocolVersion": PROTOCOL_VERSION,
                            "capabilities": {},
                            "clientInfo": {"name": "toolchat", "version": env!("CARGO_PKG_VERSION")},
                        }),
                    )
                    .await
                    .map_err(|e| AgentError::ToolDiscovery(format!("MCP initialize failed: {e}")))?;

                let server = result
                    .pointer("/serverInfo/name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                tracing::info!(url = %self.config.url, server, "MCP session initialized");

                self.notify("notifications/initialized").await?;
                Ok::<(), AgentError>(())
            })
            .await
            .map(|_| ())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params: Some(params),
        };

        let response = self.post(&body).await?;
        let rpc = read_rpc_response(response, id).await?;

        if let Some(error) = rpc.error {
            return Err(AgentError::ToolExecution(format!(
                "MCP error {} on {method}: {}",
                error.code, error.message
            )));
        }
        rpc.result
            .ok_or_else(|| AgentError::ToolExecution(format!("MCP {method}: response has no result")))
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };
        self.post(&body).await.map(|_| ())
    }

    async fn post(&self, body: &JsonRpcRequest<'_>) -> Result<Response> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header(header::ACCEPT, ACCEPT)
            .json(body);

        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(session) = self.current_session() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::ToolExecution(format!("MCP request failed: {e}")))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.store_session(session);
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::ToolExecution(format!(
                "MCP server returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }

    fn current_session(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|guard| guard.clone())
    }

    fn store_session(&self, session: &str) {
        if let Ok(mut guard) = self.session_id.write() {
            if guard.as_deref() != Some(session) {
                *guard = Some(session.to_string());
            }
        }
    }
}

#[async_trait]
impl ToolServer for McpHttpClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.ensure_initialized().await?;

        let result = self
            .request("tools/list", json!({}))
            .await
            .map_err(|e| AgentError::ToolDiscovery(e.to_string()))?;
        let listed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| AgentError::ToolDiscovery(format!("invalid tools/list result: {e}")))?;

        tracing::debug!(count = listed.tools.len(), "Fetched MCP tools");
        Ok(listed
            .tools
            .into_iter()
            .map(|t| {
                ToolDescriptor::new(
                    t.name,
                    t.description.unwrap_or_default(),
                    t.input_schema.unwrap_or_else(|| json!({"type": "object"})),
                )
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.ensure_initialized()
            .await
            .map_err(|e| AgentError::ToolExecution(e.to_string()))?;

        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| AgentError::ToolExecution(format!("invalid tools/call result: {e}")))?;

        let text = joined_text(&result.content);
        if result.is_error {
            let detail = if text.is_empty() { "tool reported an error".to_string() } else { text };
            return Err(AgentError::ToolExecution(detail));
        }

        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }
        // Tools that return JSON as text are handed back as JSON
        Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
    }
}

fn joined_text(content: &[ContentItem]) -> String {
    content
        .iter()
        .filter(|c| c.kind == "text")
        .filter_map(|c| c.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read a JSON-RPC reply from either a JSON body or an SSE body
async fn read_rpc_response(response: Response, id: u64) -> Result<JsonRpcResponse> {
    let is_sse = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));

    let body = response
        .bytes()
        .await
        .map_err(|e| AgentError::ToolExecution(format!("MCP response read failed: {e}")))?;

    if is_sse {
        parse_sse_reply(&body, id)
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AgentError::ToolExecution(format!("invalid MCP response: {e}")))
    }
}

/// Pick the reply matching `id` out of an SSE body; server notifications are skipped
fn parse_sse_reply(body: &[u8], id: u64) -> Result<JsonRpcResponse> {
    let mut decoder = SseDecoder::new();
    let mut frames = decoder.push(body);
    frames.extend(decoder.finish());

    frames
        .into_iter()
        .filter(|f| !f.data.is_empty())
        .filter_map(|f| serde_json::from_str::<JsonRpcResponse>(&f.data).ok())
        .find(|r| r.id.as_ref().and_then(Value::as_u64) == Some(id))
        .ok_or_else(|| AgentError::ToolExecution(format!("MCP stream carried no reply for request {id}")))
}
