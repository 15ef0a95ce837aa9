//! Google Gemini LLM Provider
//!
//! Implementation of `LlmProvider` over `generateContent`. Gemini does not issue
//! tool-call ids, so one is synthesized per call; function responses are paired
//! with their call by tool name.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use toolchat_core::{
    error::{AgentError, Result},
    message::{Message, Role, ToolCallRequest},
    provider::{FinishReason, GenerationOptions, LlmProvider, ModelResponse, TokenUsage},
    tool::ToolDescriptor,
};

use crate::http::{self, DEFAULT_TIMEOUT_SECS};

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_CONTEXT_WINDOW: u32 = 1_000_000;

/// Gemini provider configuration
#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub context_window: u32,
    pub timeout_secs: u64,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            base_url: DEFAULT_BASE_URL.into(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// `GEMINI_API_KEY` (required), `GEMINI_MODEL_NAME`, `GEMINI_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(http::require_env("GEMINI_API_KEY")?);
        if let Some(model) = http::env_var("GEMINI_MODEL_NAME") {
            config.model = model;
        }
        if let Some(base_url) = http::env_var("GEMINI_BASE_URL") {
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

/// Gemini LLM provider
pub struct GeminiProvider {
    client: Client,
    config: GeminiConfig,
}

impl GeminiProvider {
    pub fn from_config(config: GeminiConfig) -> Self {
        Self {
            client: http::build_client(Duration::from_secs(config.timeout_secs)),
            config,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::from_config(GeminiConfig::from_env()?))
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
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
        let model = options.model.as_deref().unwrap_or(&self.config.model);
        let url = format!("{}/models/{model}:generateContent", self.base_url());
        let body = build_request_body(messages, tools, options);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport_error(PROVIDER, &e))?;

        let response: GenerateResponse = http::check_status(PROVIDER, response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("{PROVIDER}: invalid response body: {e}")))?;

        convert_response(response)
    }

    async fn health_check(&self) -> Result<bool> {
        let result = self
            .client
            .get(format!("{}/models", self.base_url()))
            .header("x-goog-api-key", &self.config.api_key)
            .send()
            .await
            .map_err(|e| http::transport_error(PROVIDER, &e));

        let result = match result {
            Ok(response) => http::check_status(PROVIDER, response).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Gemini health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Conversion

fn build_request_body(messages: &[Message], tools: &[ToolDescriptor], options: &GenerationOptions) -> Value {
    let mut system: Vec<&str> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    let mut pending_responses: Vec<Value> = Vec::new();

    let flush = |contents: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            contents.push(json!({"role": "user", "parts": std::mem::take(pending)}));
        }
    };

    for m in messages {
        match m.role {
            Role::System => system.push(&m.content),
            Role::Tool => pending_responses.push(json!({
                "functionResponse": {
                    "name": m.name.clone().unwrap_or_default(),
                    "response": function_response_payload(&m.content),
                }
            })),
            Role::User => {
                flush(&mut contents, &mut pending_responses);
                contents.push(json!({"role": "user", "parts": [{"text": m.content}]}));
            }
            Role::Assistant => {
                flush(&mut contents, &mut pending_responses);
                let mut parts = Vec::new();
                if !m.content.trim().is_empty() {
                    parts.push(json!({"text": m.content}));
                }
                for call in &m.tool_calls {
                    parts.push(json!({"functionCall": {"name": call.name, "args": call.arguments_value()}}));
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }
        }
    }
    flush(&mut contents, &mut pending_responses);

    let mut generation_config = json!({"maxOutputTokens": options.max_tokens});
    if let Some(temperature) = options.temperature {
        generation_config["temperature"] = json!(temperature);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if !system.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
    }
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools.iter().map(ToolDescriptor::to_gemini_declaration).collect();
        body["tools"] = json!([{"functionDeclarations": declarations}]);
    }
    body
}

/// `functionResponse.response` must be an object
fn function_response_payload(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => json!({"result": other}),
        Err(_) => json!({"result": content}),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
    #[serde(default)]
    thought: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn convert_response(response: GenerateResponse) -> Result<ModelResponse> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .map_or_else(|| "no candidates".to_string(), |f| f.to_string());
        return Err(AgentError::Provider(format!("{PROVIDER}: empty response ({reason})")));
    };

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if part.thought == Some(true) {
            continue;
        }
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if let Some(call) = part.function_call {
            let id = call.id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            let arguments = call.args.unwrap_or_else(|| json!({})).to_string();
            tool_calls.push(ToolCallRequest::new(id, call.name, arguments));
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        candidate.finish_reason.as_deref().map(convert_finish_reason)
    } else {
        Some(FinishReason::ToolUse)
    };

    Ok(ModelResponse {
        text,
        tool_calls,
        usage: response
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count)),
        finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shapes() {
        let messages = vec![
            Message::system("sys"),
            Message::user("who?"),
            Message::assistant_with_tool_calls("", vec![ToolCallRequest::new("call_1", "getPlayer", r#"{"id":"A"}"#)]),
            Message::tool(r#"{"name":"Ash"}"#, "call_1", "getPlayer"),
        ];
        let tools = vec![ToolDescriptor::new("getPlayer", "", json!({"type": "object"}))];
        let body = build_request_body(&messages, &tools, &GenerationOptions::default());

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["args"]["id"], "A");
        assert_eq!(body["contents"][2]["parts"][0]["functionResponse"]["name"], "getPlayer");
        assert_eq!(body["contents"][2]["parts"][0]["functionResponse"]["response"]["name"], "Ash");
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["description"], "Execute getPlayer");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 4096);
    }

    #[test]
    fn test_non_object_tool_content_is_wrapped() {
        assert_eq!(function_response_payload("[1,2]"), json!({"result": [1, 2]}));
        assert_eq!(function_response_payload("Error: timeout"), json!({"result": "Error: timeout"}));
    }

    #[test]
    fn test_convert_response_synthesizes_ids() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "getClan", "args": {"tag": "#X"}}},
                    {"functionCall": {"name": "getPlayer"}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 40, "candidatesTokenCount": 6, "totalTokenCount": 46}
        }))
        .unwrap();

        let converted = convert_response(response).unwrap();
        assert_eq!(converted.tool_calls.len(), 2);
        assert_ne!(converted.tool_calls[0].id, converted.tool_calls[1].id);
        assert!(converted.tool_calls[0].id.starts_with("call_"));
        assert_eq!(converted.tool_calls[1].arguments, "{}");
        assert_eq!(converted.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(converted.usage, Some(TokenUsage::new(40, 6)));
    }

    #[test]
    fn test_blocked_prompt_is_provider_error() {
        let response: GenerateResponse =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap();
        let err = convert_response(response).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }
}
