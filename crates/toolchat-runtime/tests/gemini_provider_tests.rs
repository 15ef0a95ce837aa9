#![cfg(feature = "gemini")]

use serde_json::json;
use toolchat_core::{AgentError, FinishReason, GenerationOptions, LlmProvider, Message, ToolDescriptor};
use toolchat_runtime::{GeminiConfig, GeminiProvider};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> GeminiProvider {
    GeminiProvider::from_config(GeminiConfig::new("test-key").with_base_url(server.uri()))
}

#[tokio::test]
async fn generate_content_maps_function_calls() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "systemInstruction": {"parts": [{"text": "be brief"}]},
            "tools": [{"functionDeclarations": [{"name": "getCards"}]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "Looking that up."},
                    {"functionCall": {"name": "getCards", "args": {"limit": 3}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 50, "candidatesTokenCount": 8}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tools = vec![ToolDescriptor::new("getCards", "", json!({}))];
    let response = provider(&server)
        .send(
            &[Message::system("be brief"), Message::user("list cards")],
            &tools,
            &GenerationOptions::default(),
        )
        .await
        .expect("send should succeed");

    assert_eq!(response.text, "Looking that up.");
    assert_eq!(response.tool_calls.len(), 1);
    assert!(!response.tool_calls[0].id.is_empty());
    assert_eq!(response.tool_calls[0].arguments_value(), json!({"limit": 3}));
    assert_eq!(response.finish_reason, Some(FinishReason::ToolUse));
}

#[tokio::test]
async fn model_override_changes_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-pro:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "STOP"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let options = GenerationOptions {
        model: Some("gemini-2.5-pro".into()),
        ..GenerationOptions::default()
    };
    let response = provider(&server).send(&[Message::user("hello")], &[], &options).await.unwrap();
    assert_eq!(response.text, "hi");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
}

#[tokio::test]
async fn server_error_is_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": {"code": 503, "message": "The model is overloaded.", "status": "UNAVAILABLE"}
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .send(&[Message::user("hello")], &[], &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ProviderUnavailable(_)));
    assert!(err.to_string().contains("overloaded"));
}

#[tokio::test]
async fn health_check_lists_models() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .expect(1)
        .mount(&server)
        .await;

    assert!(provider(&server).health_check().await.unwrap());
}
