//! HTTP/SSE Handlers

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts, State, rejection::JsonRejection},
    http::{StatusCode, header, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use toolchat_core::{AgentError, ClearResponse, SessionIdentity, TurnRequest, TurnResponse};

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub retryable: bool,
}

/// Error returned by every handler
#[derive(Debug)]
pub struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(AgentError::Validation(rejection.body_text()))
    }
}

pub const fn status_for(err: &AgentError) -> StatusCode {
    match err {
        AgentError::Validation(_) => StatusCode::BAD_REQUEST,
        AgentError::SessionBusy(_) => StatusCode::CONFLICT,
        AgentError::Provider(_) => StatusCode::BAD_GATEWAY,
        AgentError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AgentError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), "Request failed: {}", self.0);
        } else {
            tracing::warn!(code = self.0.code(), "Request rejected: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.user_message(),
            code: self.0.code().into(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Caller identity
// ============================================================================

/// Session identity derived from the peer address and `User-Agent`
pub struct ClientIdentity(pub SessionIdentity);

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let ip = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .map_or_else(|_| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string());
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok());

        Ok(Self(SessionIdentity::from_client(ip, user_agent)))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.orchestrator.health_check().await;
    let (status, label) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    tracing::info!(status = label, "Health check");

    (
        status,
        Json(HealthResponse {
            status: label,
            version: env!("CARGO_PKG_VERSION"),
            provider: state.orchestrator.agent().provider_name().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}

/// Main chat endpoint (non-streaming)
pub async fn chat_handler(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<TurnResponse>, ApiError> {
    let Json(payload) = payload?;
    tracing::info!(message_len = payload.message.len(), "Chat request");

    let response = state
        .orchestrator
        .process_turn(TurnRequest::new(identity, payload.message))
        .await?;
    Ok(Json(response))
}

/// Streaming chat over server-sent events; one event per `TurnEvent`
pub async fn chat_stream_handler(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let Json(payload) = payload?;
    tracing::info!(message_len = payload.message.len(), "Chat stream request");

    let events = state
        .orchestrator
        .process_turn_stream(TurnRequest::new(identity, payload.message))
        .await?;

    let stream = ReceiverStream::new(events).map(|event| Event::default().event(event.name()).json_data(&event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Forget the caller's conversation
pub async fn clear_session(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
) -> Json<ClearResponse> {
    let response = state.orchestrator.clear_session(&identity).await;
    tracing::info!(cleared = response.cleared, "Session cleared");
    Json(response)
}
