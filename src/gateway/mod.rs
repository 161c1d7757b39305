//! Axum-based HTTP surface for the assistant.
//!
//! Thin adapter over the dispatcher and stores: handlers translate JSON
//! bodies into core calls and classified errors into the 2xx/4xx/5xx
//! taxonomy. Body limits and request timeouts are enforced as layers.

mod handlers;

use handlers::{
    handle_activate_persona, handle_chat, handle_chat_image, handle_create_memory,
    handle_create_persona, handle_delete_memory, handle_delete_persona, handle_delete_session,
    handle_get_memory, handle_health, handle_list_memories, handle_list_personas,
    handle_list_sessions, handle_reset_tokens, handle_restore_session, handle_search_memories,
    handle_session_history, handle_session_info, handle_token_usage, handle_update_memory,
};

use crate::config::Config;
use crate::error::KotobaError;
use crate::memory::SqliteMemoryStore;
use crate::persona::PersonaCatalog;
use crate::providers::{GeminiGateway, ModelGateway};
use crate::sessions::SessionRegistry;
use crate::usage::UsageLog;
use crate::worker::RequestDispatcher;
use axum::{
    Router,
    http::StatusCode,
    routing::{delete, get, post, put},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (32MB) — leaves room for inline images
/// while still bounding memory per request.
pub const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;
/// Request timeout — generation with retries can legitimately take a
/// few minutes.
pub const REQUEST_TIMEOUT_SECS: u64 = 180;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<RequestDispatcher>,
    pub sessions: Arc<SessionRegistry>,
    pub memories: Arc<SqliteMemoryStore>,
    pub personas: Arc<PersonaCatalog>,
    pub usage_log: Arc<UsageLog>,
    pub warning_threshold: u64,
}

impl AppState {
    /// Wire the full state from config, with the real Gemini gateway.
    pub fn from_config(config: &Config) -> Result<Self, KotobaError> {
        let api_key = config.model.resolve_api_key().ok_or_else(|| {
            KotobaError::Config(crate::error::ConfigError::Validation(
                "no API key configured: set [model] api_key or GOOGLE_API_KEY".into(),
            ))
        })?;
        let gateway: Arc<dyn ModelGateway> = Arc::new(GeminiGateway::with_base_url(
            api_key,
            &config.model.model_id,
            config.model.request_timeout_secs,
            config.model.base_url.as_deref(),
        ));
        Self::with_gateway(config, gateway)
    }

    /// Wire the state around an arbitrary gateway (tests inject stubs).
    pub fn with_gateway(
        config: &Config,
        gateway: Arc<dyn ModelGateway>,
    ) -> Result<Self, KotobaError> {
        let usage_log = Arc::new(UsageLog::open(&config.db_path())?);
        let dispatcher = Arc::new(RequestDispatcher::new(
            gateway,
            &config.reliability,
            Some(Arc::clone(&usage_log)),
        ));
        Ok(Self {
            dispatcher,
            sessions: Arc::new(SessionRegistry::new()),
            memories: Arc::new(SqliteMemoryStore::open(&config.db_path())?),
            personas: Arc::new(PersonaCatalog::load_or_default(&config.personas_path())),
            usage_log,
            warning_threshold: config.usage.warning_threshold,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/image", post(handle_chat_image))
        .route("/api/sessions", get(handle_list_sessions))
        .route("/api/sessions/{id}", get(handle_session_info))
        .route("/api/sessions/{id}", delete(handle_delete_session))
        .route("/api/sessions/{id}/history", get(handle_session_history))
        .route("/api/sessions/{id}/restore", post(handle_restore_session))
        .route("/api/tokens/usage", get(handle_token_usage))
        .route("/api/tokens/reset", post(handle_reset_tokens))
        .route("/api/memories", get(handle_list_memories))
        .route("/api/memories", post(handle_create_memory))
        .route("/api/memories/search", get(handle_search_memories))
        .route("/api/memories/{id}", get(handle_get_memory))
        .route("/api/memories/{id}", put(handle_update_memory))
        .route("/api/memories/{id}", delete(handle_delete_memory))
        .route("/api/personas", get(handle_list_personas))
        .route("/api/personas", post(handle_create_persona))
        .route("/api/personas/{id}/activate", post(handle_activate_persona))
        .route("/api/personas/{id}", delete(handle_delete_persona))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway until ctrl-c, then stop the worker lanes.
pub async fn run_gateway(host: &str, port: u16, state: AppState) -> Result<(), KotobaError> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {addr}: {e}"))?;

    let actual = listener
        .local_addr()
        .map_err(|e| anyhow::anyhow!("local_addr: {e}"))?;
    tracing::info!(addr = %actual, "gateway listening");

    let dispatcher = Arc::clone(&state.dispatcher);
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, stopping worker lanes");
            dispatcher.shutdown();
        })
        .await
        .map_err(|e| anyhow::anyhow!("gateway server error: {e}"))?;

    Ok(())
}
