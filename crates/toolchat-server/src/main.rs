//! toolchat HTTP Server
//!
//! Axum-based server exposing the chat turn API, its SSE variant, session
//! management and a health probe. Tools come from an MCP server.

mod config;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toolchat_core::{
    AgentBuilder, LlmProvider, Orchestrator, OrchestratorConfig, SessionStore, ToolRegistry,
    session::spawn_eviction_task,
};
use toolchat_runtime::{AnthropicProvider, GeminiProvider, McpHttpClient, McpServerConfig, OpenAiProvider};

use crate::config::{ProviderKind, ServerConfig};
use crate::handlers::{chat_handler, chat_stream_handler, clear_session, health_check};
use crate::state::AppState;

fn build_provider(kind: ProviderKind) -> toolchat_core::Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::from_env()?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_env()?),
        ProviderKind::Gemini => Arc::new(GeminiProvider::from_env()?),
    };
    Ok(provider)
}

/// Router with every endpoint and the shared layers
fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", post(chat_stream_handler))
        .route("/api/session", delete(clear_session))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    // Initialize LLM provider
    let provider = build_provider(config.provider)?;
    match provider.health_check().await {
        Ok(true) => tracing::info!(provider = provider.name(), "Model provider reachable"),
        Ok(false) | Err(_) => {
            tracing::warn!(provider = provider.name(), "Model provider not reachable, turns will fail until it is");
        }
    }

    // Tool server
    let tools = match &config.mcp_url {
        Some(url) => {
            tracing::info!(url = %url, "Using MCP tool server");
            let mut mcp = McpServerConfig::new(url.clone());
            if let Some(token) = &config.mcp_auth_token {
                mcp = mcp.with_auth(token.clone());
            }
            ToolRegistry::new(Arc::new(McpHttpClient::new(mcp)))
        }
        None => {
            tracing::warn!("MCP_SERVER_URL is empty, tools disabled");
            ToolRegistry::disabled()
        }
    };

    let mut agent = AgentBuilder::new()
        .provider(provider)
        .tools(Arc::new(tools))
        .max_iterations(config.max_iterations)
        .response_reserve(config.response_reserve);
    if let Some(prompt) = &config.system_prompt {
        agent = agent.system_prompt(prompt.clone());
    }
    if let Some(window) = config.context_window {
        agent = agent.context_window(window);
    }
    let agent = Arc::new(agent.build()?);

    // Sessions and their eviction sweep
    let sessions = Arc::new(SessionStore::new());
    let eviction = spawn_eviction_task(Arc::clone(&sessions), &config.session);

    let orchestrator = Orchestrator::new(
        agent,
        sessions,
        OrchestratorConfig {
            max_message_chars: config.max_message_chars,
            busy_policy: config.busy_policy,
        },
    );
    let app = app(AppState::new(Arc::new(orchestrator)));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("toolchat server running on http://{}", config.bind_addr);
    tracing::info!("  GET    /health           - Health check");
    tracing::info!("  POST   /api/chat         - Send message");
    tracing::info!("  POST   /api/chat/stream  - Send message, SSE reply");
    tracing::info!("  DELETE /api/session      - Clear conversation");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    eviction.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}
