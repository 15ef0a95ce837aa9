//! Orchestrator
//!
//! Per-request wiring: validate the message, lock the caller's session, run the agent
//! loop on its history and persist the result. Holds only references to its
//! collaborators.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::agent::{Agent, TurnEvent, TurnResult};
use crate::error::{AgentError, Result};
use crate::session::{BusyPolicy, SessionIdentity, SessionStore};

/// Default upper bound on a user message, in characters
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 32_000;

const EVENT_BUFFER: usize = 64;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_message_chars: usize,
    pub busy_policy: BusyPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            busy_policy: BusyPolicy::Wait,
        }
    }
}

/// One inbound user message
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub identity: SessionIdentity,
    pub message: String,
}

impl TurnRequest {
    pub fn new(identity: SessionIdentity, message: impl Into<String>) -> Self {
        Self {
            identity,
            message: message.into(),
        }
    }
}

/// Reply to a completed turn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnResponse {
    pub conversation_id: String,
    #[serde(flatten)]
    pub result: TurnResult,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearResponse {
    pub cleared: bool,
}

/// Entry point for the API layer
pub struct Orchestrator {
    agent: Arc<Agent>,
    sessions: Arc<SessionStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(agent: Arc<Agent>, sessions: Arc<SessionStore>, config: OrchestratorConfig) -> Self {
        Self { agent, sessions, config }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Reject empty or oversized messages before any state is touched
    pub fn validate(&self, message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Err(AgentError::Validation("message must not be empty".into()));
        }
        let chars = message.chars().count();
        if chars > self.config.max_message_chars {
            return Err(AgentError::Validation(format!(
                "message is {chars} characters, the limit is {}",
                self.config.max_message_chars
            )));
        }
        Ok(())
    }

    /// Run a turn to completion
    pub async fn process_turn(&self, request: TurnRequest) -> Result<TurnResponse> {
        self.validate(&request.message)?;

        let mut session = self.sessions.acquire(&request.identity, self.config.busy_policy).await?;
        let conversation_id = session.id.clone();
        let span = tracing::info_span!("turn", conversation_id = %conversation_id);

        let outcome = self
            .agent
            .run_turn(&session.history, &request.message)
            .instrument(span)
            .await
            .inspect_err(|e| tracing::warn!(conversation_id = %conversation_id, error = %e, "Turn failed"))?;

        session.history = outcome.history;
        session.touch();

        Ok(TurnResponse {
            conversation_id,
            result: outcome.result,
        })
    }

    /// Run a turn in the background, streaming its events.
    ///
    /// Validation and the busy check happen before this returns. The stream starts
    /// with `message_start` and ends with `message_stop` or `error`; dropping the
    /// receiver cancels the turn at its next model call without persisting anything.
    pub async fn process_turn_stream(&self, request: TurnRequest) -> Result<mpsc::Receiver<TurnEvent>> {
        self.validate(&request.message)?;

        let mut session = self.sessions.acquire(&request.identity, self.config.busy_policy).await?;
        let conversation_id = session.id.clone();
        let agent = Arc::clone(&self.agent);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = tracing::info_span!("turn", conversation_id = %conversation_id, streaming = true);

        tokio::spawn(
            async move {
                let start = TurnEvent::MessageStart {
                    conversation_id: conversation_id.clone(),
                };
                if tx.send(start).await.is_err() {
                    return;
                }

                match agent.run_turn_streaming(&session.history, &request.message, &tx).await {
                    Ok(outcome) => {
                        session.history = outcome.history;
                        session.touch();
                        let _ = tx
                            .send(TurnEvent::MessageStop {
                                conversation_id,
                                result: outcome.result,
                            })
                            .await;
                    }
                    Err(AgentError::Cancelled) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Streaming turn failed");
                        let _ = tx.send(TurnEvent::from_error(&e)).await;
                    }
                }
            }
            .instrument(span),
        );

        Ok(rx)
    }

    /// Drop the caller's conversation
    pub async fn clear_session(&self, identity: &SessionIdentity) -> ClearResponse {
        ClearResponse {
            cleared: self.sessions.clear(identity).await,
        }
    }

    /// Whether a minimal provider round trip succeeds
    pub async fn health_check(&self) -> bool {
        match self.agent.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                tracing::warn!(provider = %self.agent.provider_name(), error = %e, "Health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentBuilder;
    use crate::message::Role;
    use crate::provider::ModelResponse;
    use crate::testing::{ScriptedProvider, ScriptedToolServer, ToolBehavior, tool_call_response};
    use crate::tool::{FailureKind, ToolOutcome, ToolRegistry};
    use serde_json::json;
    use std::time::Duration;

    fn identity(n: u8) -> SessionIdentity {
        SessionIdentity::from_client(format!("192.168.1.{n}"), Some("tests"))
    }

    fn orchestrator_with(
        provider: Arc<ScriptedProvider>,
        tools: ScriptedToolServer,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        let registry = ToolRegistry::new(Arc::new(tools)).with_call_timeout(Duration::from_millis(50));
        let agent = AgentBuilder::new()
            .provider(provider)
            .tools(Arc::new(registry))
            .max_iterations(5)
            .build()
            .unwrap();
        Orchestrator::new(Arc::new(agent), Arc::new(SessionStore::new()), config)
    }

    fn orchestrator(provider: Arc<ScriptedProvider>, tools: ScriptedToolServer) -> Orchestrator {
        orchestrator_with(provider, tools, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn test_plain_reply() {
        let provider = Arc::new(ScriptedProvider::new([ModelResponse::text("hi")]));
        let orch = orchestrator(provider.clone(), ScriptedToolServer::new());

        let response = orch.process_turn(TurnRequest::new(identity(1), "hello")).await.unwrap();
        assert_eq!(response.result.content, "hi");
        assert_eq!(response.result.iterations, 1);
        assert!(response.result.tool_outcomes.is_empty());
        assert!(!response.result.truncated);

        let first_call = &provider.calls()[0];
        assert_eq!(first_call[0].role, Role::System);
        assert_eq!(first_call.last().unwrap().content, "hello");
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_call_response("c1", "getPlayer", json!({"id": "ABC"})),
            ModelResponse::text("Ash has 4000 trophies"),
        ]));
        let tools = ScriptedToolServer::new().tool("getPlayer", ToolBehavior::Return(json!({"name": "Ash"})));
        let orch = orchestrator(provider.clone(), tools);

        let response = orch.process_turn(TurnRequest::new(identity(1), "who is ABC?")).await.unwrap();
        assert_eq!(response.result.content, "Ash has 4000 trophies");
        assert_eq!(response.result.iterations, 2);
        assert_eq!(response.result.tool_outcomes.len(), 1);
        assert!(response.result.tool_outcomes[0].is_success());

        // second call saw history ++ [user, assistant(tool call), tool result]
        let second = &provider.calls()[1];
        let roles: Vec<Role> = second.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);
        assert_eq!(second[3].content, r#"{"name":"Ash"}"#);
    }

    #[tokio::test]
    async fn test_tool_timeout_continues_loop() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_call_response("c1", "getClan", json!({"tag": "#XYZ"})),
            ModelResponse::text("The clan lookup timed out."),
        ]));
        let tools = ScriptedToolServer::new().tool("getClan", ToolBehavior::Hang);
        let orch = orchestrator(provider, tools);

        let response = orch.process_turn(TurnRequest::new(identity(1), "clan?")).await.unwrap();
        assert_eq!(response.result.iterations, 2);
        match &response.result.tool_outcomes[..] {
            [ToolOutcome::Failure { kind, .. }] => assert_eq!(*kind, FailureKind::Execution),
            other => panic!("unexpected outcomes {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_tool_calls_do_not_abort() {
        let provider = Arc::new(ScriptedProvider::new([
            ModelResponse {
                tool_calls: vec![
                    crate::message::ToolCallRequest::new("c1", "getCard", "{}"),
                    crate::message::ToolCallRequest::new("c2", "getPlayer", "{\"id\":"),
                ],
                ..ModelResponse::default()
            },
            ModelResponse::text("sorry"),
        ]));
        let tools = ScriptedToolServer::new().tool("getPlayer", ToolBehavior::Return(json!({})));
        let orch = orchestrator(provider, tools);

        let response = orch.process_turn(TurnRequest::new(identity(1), "x")).await.unwrap();
        let kinds: Vec<_> = response
            .result
            .tool_outcomes
            .iter()
            .map(|o| match o {
                ToolOutcome::Failure { kind, .. } => Some(*kind),
                ToolOutcome::Success { .. } => None,
            })
            .collect();
        assert_eq!(kinds, vec![Some(FailureKind::UnknownTool), Some(FailureKind::MalformedArguments)]);
        assert_eq!(response.result.content, "sorry");
    }

    #[tokio::test]
    async fn test_iteration_limit_returns_partial_content() {
        let mut looping = tool_call_response("c1", "getPlayer", json!({}));
        looping.text = "still looking".into();
        let provider = Arc::new(ScriptedProvider::repeating(looping));
        let tools = ScriptedToolServer::new().tool("getPlayer", ToolBehavior::Return(json!({"ok": true})));
        let orch = orchestrator(provider.clone(), tools);

        let response = orch.process_turn(TurnRequest::new(identity(1), "loop")).await.unwrap();
        assert_eq!(provider.call_count(), 5);
        assert_eq!(response.result.iterations, 5);
        assert!(response.result.truncated);
        assert!(response.result.content.contains("still looking"));
        assert_eq!(response.result.tool_outcomes.len(), 5);
        assert!(response.result.warnings.iter().any(|w| w.contains("Maximum iterations")));
    }

    #[tokio::test]
    async fn test_history_persists_and_alternates() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_call_response("c1", "getPlayer", json!({})),
            ModelResponse::text("first"),
            ModelResponse::text("second"),
        ]));
        let tools = ScriptedToolServer::new().tool("getPlayer", ToolBehavior::Return(json!({})));
        let orch = orchestrator(provider.clone(), tools);

        let first = orch.process_turn(TurnRequest::new(identity(1), "one")).await.unwrap();
        let second = orch.process_turn(TurnRequest::new(identity(1), "two")).await.unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);

        let handle = orch.sessions().get_or_create(&identity(1)).await;
        let history = handle.lock().await.history.clone();
        assert_eq!(history.len(), 6);
        for pair in history.windows(2) {
            assert!(!(pair[0].role == Role::User && pair[1].role == Role::User));
        }

        // the third provider call carried the whole first exchange
        assert_eq!(provider.calls()[2].len(), 1 + 4 + 1);
    }

    #[tokio::test]
    async fn test_provider_error_persists_nothing() {
        let provider = Arc::new(
            ScriptedProvider::new([]).then_error(AgentError::ProviderUnavailable("503".into())),
        );
        let orch = orchestrator(provider, ScriptedToolServer::new());

        let err = orch.process_turn(TurnRequest::new(identity(1), "hello")).await.unwrap_err();
        assert!(matches!(err, AgentError::ProviderUnavailable(_)));

        let handle = orch.sessions().get_or_create(&identity(1)).await;
        assert!(handle.lock().await.history.is_empty());
    }

    #[tokio::test]
    async fn test_validation() {
        let provider = Arc::new(ScriptedProvider::new([]));
        let orch = orchestrator_with(
            provider.clone(),
            ScriptedToolServer::new(),
            OrchestratorConfig {
                max_message_chars: 10,
                ..OrchestratorConfig::default()
            },
        );

        for message in ["", "   ", "this message is too long"] {
            let err = orch.process_turn(TurnRequest::new(identity(1), message)).await.unwrap_err();
            assert!(matches!(err, AgentError::Validation(_)), "{message:?}");
        }
        assert_eq!(provider.call_count(), 0);
        assert!(orch.sessions().is_empty().await);
    }

    #[tokio::test]
    async fn test_discovery_failure_degrades_to_no_tools() {
        let provider = Arc::new(ScriptedProvider::new([ModelResponse::text("no tools today")]));
        let tools = ScriptedToolServer::new().tool("getPlayer", ToolBehavior::Return(json!({})));
        tools.set_discovery_failure(true);
        let orch = orchestrator(provider.clone(), tools);

        let response = orch.process_turn(TurnRequest::new(identity(1), "hi")).await.unwrap();
        assert_eq!(response.result.content, "no tools today");
        assert_eq!(response.result.warnings.len(), 1);
        assert_eq!(provider.tools_seen(), vec![0]);
    }

    #[tokio::test]
    async fn test_fallback_summary_when_answer_empty() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_call_response("c1", "getPlayer", json!({})),
            ModelResponse::text(""),
        ]));
        let tools = ScriptedToolServer::new().tool("getPlayer", ToolBehavior::Return(json!({"name": "Ash"})));
        let orch = orchestrator(provider, tools);

        let response = orch.process_turn(TurnRequest::new(identity(1), "who?")).await.unwrap();
        assert!(response.result.content.contains("**getPlayer**"));
    }

    #[tokio::test]
    async fn test_clear_session() {
        let provider = Arc::new(ScriptedProvider::new([ModelResponse::text("hi")]));
        let orch = orchestrator(provider, ScriptedToolServer::new());

        assert!(!orch.clear_session(&identity(1)).await.cleared);
        orch.process_turn(TurnRequest::new(identity(1), "hello")).await.unwrap();
        assert!(orch.clear_session(&identity(1)).await.cleared);

        let handle = orch.sessions().get_or_create(&identity(1)).await;
        assert!(handle.lock().await.history.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_creates_one_session() {
        let store = Arc::new(SessionStore::new());
        let id = identity(9);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                tokio::spawn(async move {
                    let handle = store.get_or_create(&id).await;
                    let session = handle.lock().await;
                    session.id.clone()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_reject_policy_returns_session_busy() {
        let provider = Arc::new(
            ScriptedProvider::new([ModelResponse::text("a"), ModelResponse::text("b")])
                .with_delay(Duration::from_millis(200)),
        );
        let orch = Arc::new(orchestrator_with(
            provider,
            ScriptedToolServer::new(),
            OrchestratorConfig {
                busy_policy: BusyPolicy::Reject,
                ..OrchestratorConfig::default()
            },
        ));

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.process_turn(TurnRequest::new(identity(1), "one")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = orch.process_turn(TurnRequest::new(identity(1), "two")).await.unwrap_err();
        assert!(matches!(err, AgentError::SessionBusy(_)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_policy_serializes_turns() {
        let provider = Arc::new(
            ScriptedProvider::new([ModelResponse::text("a"), ModelResponse::text("b")])
                .with_delay(Duration::from_millis(50)),
        );
        let orch = Arc::new(orchestrator(provider.clone(), ScriptedToolServer::new()));

        let turns: Vec<_> = ["one", "two"]
            .into_iter()
            .map(|message| {
                let orch = Arc::clone(&orch);
                tokio::spawn(async move { orch.process_turn(TurnRequest::new(identity(1), message)).await })
            })
            .collect();
        for turn in turns {
            turn.await.unwrap().unwrap();
        }

        // the later call saw the earlier exchange, so the turns did not overlap
        let calls = provider.calls();
        assert_eq!(calls[0].len(), 2);
        assert_eq!(calls[1].len(), 4);
    }

    #[tokio::test]
    async fn test_stream_event_order() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_call_response("c1", "getPlayer", json!({"id": "ABC"})),
            ModelResponse::text("Ash"),
        ]));
        let tools = ScriptedToolServer::new().tool("getPlayer", ToolBehavior::Return(json!({"name": "Ash"})));
        let orch = orchestrator(provider, tools);

        let mut rx = orch
            .process_turn_stream(TurnRequest::new(identity(1), "who?"))
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec![
                "message_start",
                "tool_use_start",
                "tool_input_delta",
                "tool_result",
                "content_delta",
                "message_stop"
            ]
        );

        let handle = orch.sessions().get_or_create(&identity(1)).await;
        assert_eq!(handle.lock().await.history.len(), 4);
    }

    #[tokio::test]
    async fn test_stream_cancelled_persists_nothing() {
        let provider = Arc::new(
            ScriptedProvider::new([
                tool_call_response("c1", "getPlayer", json!({})),
                ModelResponse::text("never seen"),
            ])
            .with_delay(Duration::from_millis(30)),
        );
        let tools = ScriptedToolServer::new().tool("getPlayer", ToolBehavior::Return(json!({})));
        let orch = orchestrator(provider.clone(), tools);

        let mut rx = orch
            .process_turn_stream(TurnRequest::new(identity(1), "who?"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.map(|e| e.name()), Some("message_start"));
        drop(rx);

        // the turn releases the session lock once it notices the closed channel
        let session = orch
            .sessions()
            .acquire(&identity(1), BusyPolicy::Wait)
            .await
            .unwrap();
        assert!(session.history.is_empty());
        assert!(provider.call_count() <= 1);
    }

    #[tokio::test]
    async fn test_stream_rejects_invalid_message_up_front() {
        let provider = Arc::new(ScriptedProvider::new([]));
        let orch = orchestrator(provider, ScriptedToolServer::new());
        let err = orch
            .process_turn_stream(TurnRequest::new(identity(1), " "))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_health_check() {
        let provider = Arc::new(ScriptedProvider::new([]));
        let orch = orchestrator(provider.clone(), ScriptedToolServer::new());
        assert!(orch.health_check().await);
        provider.set_healthy(false);
        assert!(!orch.health_check().await);
    }
}
