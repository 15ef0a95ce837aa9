//! Tool System
//!
//! Tools live on an external tool server. [`ToolRegistry`] is the client side: it
//! discovers descriptors once, caches them, reshapes their schemas for each provider
//! and turns every model tool call into exactly one [`ToolOutcome`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};
use crate::message::ToolCallRequest;

/// Tool definition as advertised by the tool server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to the LLM)
    #[serde(default)]
    pub description: String,

    /// JSON Schema for the arguments object
    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Input schema guaranteed to be an object schema with a `properties` map
    pub fn normalized_schema(&self) -> Value {
        let mut schema = match &self.input_schema {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        schema.entry("type").or_insert_with(|| json!("object"));
        if schema.get("type") == Some(&json!("object")) {
            schema.entry("properties").or_insert_with(|| json!({}));
        }
        Value::Object(schema)
    }

    /// Property names the schema marks as required
    pub fn required_properties(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// OpenAI chat-completions `tools[]` entry
    pub fn to_openai_function(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.normalized_schema(),
            }
        })
    }

    /// Anthropic messages `tools[]` entry
    pub fn to_anthropic_tool(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.normalized_schema(),
        })
    }

    /// Gemini `functionDeclarations[]` entry
    pub fn to_gemini_declaration(&self) -> Value {
        let description = if self.description.trim().is_empty() {
            format!("Execute {}", self.name)
        } else {
            self.description.clone()
        };
        json!({
            "name": self.name,
            "description": description,
            "parametersJsonSchema": self.normalized_schema(),
        })
    }
}

/// A parsed tool call, ready to send to the tool server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Value,
    pub request_id: String,
}

impl ToolInvocation {
    /// Parse the raw call the model emitted. Blank arguments mean `{}`; anything that
    /// is not a JSON object is malformed.
    pub fn from_request(request: &ToolCallRequest) -> Result<Self> {
        let raw = request.arguments.trim();
        let arguments = if raw.is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(raw)
                .map_err(|e| AgentError::MalformedArguments(format!("{}: {e}", request.name)))?
        };
        if !arguments.is_object() {
            return Err(AgentError::MalformedArguments(format!(
                "{}: arguments must be a JSON object",
                request.name
            )));
        }

        let request_id = if request.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            request.id.clone()
        };

        Ok(Self {
            tool_name: request.name.clone(),
            arguments,
            request_id,
        })
    }
}

/// Why a tool call failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownTool,
    MalformedArguments,
    Execution,
}

/// Result of one tool call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        request_id: String,
        tool_name: String,
        payload: Value,
    },
    Failure {
        request_id: String,
        tool_name: String,
        kind: FailureKind,
        error: String,
    },
}

impl ToolOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Failure { request_id, .. } => request_id,
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            Self::Success { tool_name, .. } | Self::Failure { tool_name, .. } => tool_name,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Content of the tool turn the model sees next
    pub fn to_message_content(&self) -> String {
        match self {
            Self::Success { payload: Value::String(text), .. } => text.clone(),
            Self::Success { payload, .. } => payload.to_string(),
            Self::Failure { error, .. } => format!("Error: {error}"),
        }
    }

    fn failure(request: &ToolCallRequest, err: &AgentError) -> Self {
        let kind = match err {
            AgentError::UnknownTool(_) => FailureKind::UnknownTool,
            AgentError::MalformedArguments(_) => FailureKind::MalformedArguments,
            _ => FailureKind::Execution,
        };
        Self::Failure {
            request_id: request.id.clone(),
            tool_name: request.name.clone(),
            kind,
            error: err.to_string(),
        }
    }
}

/// Black-box tool protocol client
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Tools the server currently offers
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Run one tool; one request/response exchange per call
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
}

/// Default per-call tool timeout
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Client-side registry of tool-server tools
pub struct ToolRegistry {
    server: Option<Arc<dyn ToolServer>>,
    cache: RwLock<Option<Arc<[ToolDescriptor]>>>,
    call_timeout: Duration,
}

impl ToolRegistry {
    /// Registry backed by a tool server. Nothing is contacted until first use.
    pub fn new(server: Arc<dyn ToolServer>) -> Self {
        Self {
            server: Some(server),
            cache: RwLock::new(None),
            call_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Registry with no tool server; the model never sees tools
    pub fn disabled() -> Self {
        Self {
            server: None,
            cache: RwLock::new(Some(Arc::from(Vec::new()))),
            call_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Override the per-call timeout
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Fetch descriptors, serving the cache after the first success.
    /// Failures are not cached so the next call retries.
    pub async fn discover(&self) -> Result<Arc<[ToolDescriptor]>> {
        if let Some(tools) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(tools));
        }

        let mut cache = self.cache.write().await;
        if let Some(tools) = cache.as_ref() {
            return Ok(Arc::clone(tools));
        }

        let Some(server) = &self.server else {
            return Ok(Arc::from(Vec::new()));
        };

        let listed = server
            .list_tools()
            .await
            .map_err(|e| AgentError::ToolDiscovery(e.to_string()))?;

        let mut tools: Vec<ToolDescriptor> = Vec::with_capacity(listed.len());
        for tool in listed {
            if tools.iter().any(|t| t.name == tool.name) {
                tracing::warn!(tool = %tool.name, "Duplicate tool name from tool server, keeping first");
                continue;
            }
            tools.push(tool);
        }

        tracing::info!(
            count = tools.len(),
            tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Discovered tools"
        );

        let tools: Arc<[ToolDescriptor]> = Arc::from(tools);
        *cache = Some(Arc::clone(&tools));
        Ok(tools)
    }

    /// Drop cached descriptors; the next [`ToolRegistry::discover`] refetches
    pub async fn refresh(&self) {
        if self.server.is_some() {
            *self.cache.write().await = None;
        }
    }

    /// Invoke a tool after checking it is known and its required arguments are present
    pub async fn invoke(&self, invocation: &ToolInvocation) -> Result<Value> {
        let tools = self
            .discover()
            .await
            .map_err(|_| AgentError::UnknownTool(invocation.tool_name.clone()))?;
        let descriptor = tools
            .iter()
            .find(|t| t.name == invocation.tool_name)
            .ok_or_else(|| AgentError::UnknownTool(invocation.tool_name.clone()))?;

        for name in descriptor.required_properties() {
            if invocation.arguments.get(name).is_none() {
                return Err(AgentError::MalformedArguments(format!(
                    "{}: missing required parameter '{name}'",
                    invocation.tool_name
                )));
            }
        }

        let server = self
            .server
            .as_ref()
            .ok_or_else(|| AgentError::UnknownTool(invocation.tool_name.clone()))?;

        tokio::time::timeout(
            self.call_timeout,
            server.call_tool(&invocation.tool_name, invocation.arguments.clone()),
        )
        .await
        .map_err(|_| {
            AgentError::ToolExecution(format!(
                "{} timed out after {}s",
                invocation.tool_name,
                self.call_timeout.as_secs_f32()
            ))
        })?
    }

    /// Execute one model tool call end to end. Never fails: every error becomes a
    /// [`ToolOutcome::Failure`].
    pub async fn execute(&self, request: &ToolCallRequest) -> ToolOutcome {
        let invocation = match ToolInvocation::from_request(request) {
            Ok(invocation) => invocation,
            Err(e) => return ToolOutcome::failure(request, &e),
        };

        match self.invoke(&invocation).await {
            Ok(payload) => ToolOutcome::Success {
                request_id: request.id.clone(),
                tool_name: request.name.clone(),
                payload,
            },
            Err(e) => {
                tracing::warn!(tool = %request.name, request_id = %request.id, error = %e, "Tool call failed");
                ToolOutcome::failure(request, &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyServer {
        list_calls: AtomicUsize,
        fail_first_list: bool,
    }

    #[async_trait]
    impl ToolServer for FlakyServer {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
            let n = self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_list && n == 0 {
                return Err(AgentError::ToolDiscovery("connection refused".into()));
            }
            Ok(vec![
                ToolDescriptor::new(
                    "getPlayer",
                    "Look up a player",
                    json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]}),
                ),
                ToolDescriptor::new("getPlayer", "duplicate", json!({})),
                ToolDescriptor::new("slow", "", json!({})),
            ])
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
            if name == "slow" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(json!({"echo": arguments}))
        }
    }

    fn server(fail_first_list: bool) -> Arc<FlakyServer> {
        Arc::new(FlakyServer {
            list_calls: AtomicUsize::new(0),
            fail_first_list,
        })
    }

    #[tokio::test]
    async fn test_discover_caches_and_dedupes() {
        let srv = server(false);
        let registry = ToolRegistry::new(srv.clone());

        let tools = registry.discover().await.unwrap();
        assert_eq!(tools.len(), 2);
        registry.discover().await.unwrap();
        assert_eq!(srv.list_calls.load(Ordering::SeqCst), 1);

        registry.refresh().await;
        registry.discover().await.unwrap();
        assert_eq!(srv.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_discovery_is_retried() {
        let srv = server(true);
        let registry = ToolRegistry::new(srv.clone());

        assert!(matches!(registry.discover().await, Err(AgentError::ToolDiscovery(_))));
        assert_eq!(registry.discover().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_outcomes() {
        let registry = ToolRegistry::new(server(false));

        let ok = registry
            .execute(&ToolCallRequest::new("c1", "getPlayer", r#"{"id":"ABC"}"#))
            .await;
        assert!(ok.is_success());

        let unknown = registry.execute(&ToolCallRequest::new("c2", "getCard", "{}")).await;
        assert!(matches!(unknown, ToolOutcome::Failure { kind: FailureKind::UnknownTool, .. }));

        let malformed = registry.execute(&ToolCallRequest::new("c3", "getPlayer", "{\"id\":")).await;
        assert!(matches!(malformed, ToolOutcome::Failure { kind: FailureKind::MalformedArguments, .. }));

        let missing = registry.execute(&ToolCallRequest::new("c4", "getPlayer", "{}")).await;
        assert!(matches!(missing, ToolOutcome::Failure { kind: FailureKind::MalformedArguments, .. }));
        assert_eq!(missing.request_id(), "c4");
    }

    #[tokio::test]
    async fn test_call_timeout_is_execution_failure() {
        let registry = ToolRegistry::new(server(false)).with_call_timeout(Duration::from_millis(20));
        let outcome = registry.execute(&ToolCallRequest::new("c1", "slow", "")).await;
        match outcome {
            ToolOutcome::Failure { kind, error, .. } => {
                assert_eq!(kind, FailureKind::Execution);
                assert!(error.contains("timed out"));
            }
            ToolOutcome::Success { .. } => panic!("expected timeout failure"),
        }
    }

    #[tokio::test]
    async fn test_disabled_registry_has_no_tools() {
        let registry = ToolRegistry::disabled();
        assert!(registry.discover().await.unwrap().is_empty());
        let outcome = registry.execute(&ToolCallRequest::new("c1", "anything", "{}")).await;
        assert!(matches!(outcome, ToolOutcome::Failure { kind: FailureKind::UnknownTool, .. }));
    }

    #[test]
    fn test_schema_shapes() {
        let tool = ToolDescriptor::new("getClan", "", json!({"properties": {"tag": {"type": "string"}}}));

        let openai = tool.to_openai_function();
        assert_eq!(openai["type"], "function");
        assert_eq!(openai["function"]["parameters"]["type"], "object");

        let anthropic = tool.to_anthropic_tool();
        assert_eq!(anthropic["input_schema"]["properties"]["tag"]["type"], "string");

        let gemini = tool.to_gemini_declaration();
        assert_eq!(gemini["description"], "Execute getClan");
        assert!(gemini.get("parametersJsonSchema").is_some());
    }

    #[test]
    fn test_invocation_rejects_non_object_arguments() {
        let err = ToolInvocation::from_request(&ToolCallRequest::new("c1", "t", "[1,2]")).unwrap_err();
        assert!(matches!(err, AgentError::MalformedArguments(_)));
    }

    #[test]
    fn test_outcome_message_content() {
        let success = ToolOutcome::Success {
            request_id: "c1".into(),
            tool_name: "getPlayer".into(),
            payload: json!({"name": "Ash"}),
        };
        assert_eq!(success.to_message_content(), r#"{"name":"Ash"}"#);

        let failure = ToolOutcome::Failure {
            request_id: "c2".into(),
            tool_name: "getClan".into(),
            kind: FailureKind::Execution,
            error: "timeout".into(),
        };
        assert_eq!(failure.to_message_content(), "Error: timeout");
    }
}
