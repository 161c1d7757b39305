use super::AppState;
use crate::error::{GatewayError, StoreError, WorkerError};
use crate::ledger::ConversationTurn;
use crate::memory::{MemoryFilter, MemoryPatch, MemorySort, NewMemory};
use crate::persona::NewPersona;
use crate::providers::ImageAttachment;
use crate::sessions::SessionState;
use crate::worker::user_message;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

type ApiResponse = (StatusCode, Json<Value>);

fn ok(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

/// Map a worker failure onto the HTTP status taxonomy. Every body
/// carries the classified user message and a retry affordance flag.
fn worker_error_response(error: &WorkerError) -> ApiResponse {
    let status = match error {
        WorkerError::RetryExhausted { source, .. } => match source {
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Auth => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::ServiceUnavailable(_) | GatewayError::Network(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        WorkerError::Superseded => StatusCode::CONFLICT,
        WorkerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    let kind = match error {
        WorkerError::RetryExhausted { source, .. } => source.kind(),
        WorkerError::Superseded => "superseded",
        WorkerError::ShuttingDown => "shutting_down",
    };
    (
        status,
        Json(json!({
            "error": user_message(error),
            "kind": kind,
            "retryable": true,
        })),
    )
}

fn store_error_response(error: &StoreError) -> ApiResponse {
    tracing::error!(%error, "store operation failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage operation failed")
}

/// Resolve the persona prefix for a chat call: an explicit character id
/// wins (404 when unknown), otherwise the active persona applies.
fn resolve_persona_prefix(
    state: &AppState,
    session: &SessionState,
    character_id: Option<&str>,
) -> Result<Option<String>, ApiResponse> {
    match character_id {
        Some("default") | None => Ok(state.personas.active_prefix()),
        Some(id) => match state.personas.get(id) {
            Some(persona) => {
                session.set_character_id(Some(id.to_string()));
                Ok(Some(persona.system_prompt()))
            }
            None => Err(error_body(StatusCode::NOT_FOUND, "character not found")),
        },
    }
}

// ── Health ───────────────────────────────────────────────────────────

pub(super) async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ── Chat ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct ChatRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub character_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ChatImageRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub character_id: Option<String>,
    /// Base64-encoded image bytes.
    pub image: String,
    pub mime_type: String,
}

async fn run_chat(
    state: &AppState,
    session_id: &str,
    message: &str,
    character_id: Option<&str>,
    image: Option<ImageAttachment>,
) -> ApiResponse {
    let session = state.sessions.get_or_create(session_id);
    let prefix = match resolve_persona_prefix(state, &session, character_id) {
        Ok(prefix) => prefix,
        Err(response) => return response,
    };

    match state
        .dispatcher
        .submit(session_id, &session.ledger, message, image, prefix.as_deref())
        .await
    {
        Ok(reply) => ok(json!({
            "session_id": session_id,
            "response": reply.text,
            "tokens_used": reply.tokens_used,
            "response_time": reply.elapsed.as_secs_f64(),
            "timestamp": Utc::now().to_rfc3339(),
        })),
        Err(error) => worker_error_response(&error),
    }
}

pub(super) async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResponse {
    run_chat(
        &state,
        &request.session_id,
        &request.message,
        request.character_id.as_deref(),
        None,
    )
    .await
}

pub(super) async fn handle_chat_image(
    State(state): State<AppState>,
    Json(request): Json<ChatImageRequest>,
) -> ApiResponse {
    let data = match BASE64.decode(request.image.as_bytes()) {
        Ok(data) => data,
        Err(error) => {
            return error_body(
                StatusCode::BAD_REQUEST,
                format!("image is not valid base64: {error}"),
            );
        }
    };
    let image = ImageAttachment {
        data,
        mime_type: request.mime_type.clone(),
    };
    run_chat(
        &state,
        &request.session_id,
        &request.message,
        request.character_id.as_deref(),
        Some(image),
    )
    .await
}

// ── Sessions ─────────────────────────────────────────────────────────

pub(super) async fn handle_list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.sessions.list()))
}

pub(super) async fn handle_session_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse {
    match state.sessions.get(&id) {
        Some(session) => ok(json!(session.info())),
        None => error_body(StatusCode::NOT_FOUND, "session not found"),
    }
}

pub(super) async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse {
    if state.sessions.remove(&id) {
        ok(json!({ "message": "session deleted" }))
    } else {
        error_body(StatusCode::NOT_FOUND, "session not found")
    }
}

pub(super) async fn handle_session_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse {
    match state.sessions.get(&id) {
        Some(session) => ok(json!({
            "session_id": id,
            "history": session.ledger.history_snapshot(),
        })),
        None => error_body(StatusCode::NOT_FOUND, "session not found"),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RestoreRequest {
    pub memory_id: String,
}

/// Resume a saved conversation: the memory's snapshot replaces the
/// session history wholesale.
pub(super) async fn handle_restore_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> ApiResponse {
    let memory = match state.memories.get(&request.memory_id) {
        Ok(Some(memory)) => memory,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "memory not found"),
        Err(error) => return store_error_response(&error),
    };

    let session = state.sessions.get_or_create(&id);
    let turns: Vec<ConversationTurn> = memory.conversation.clone();
    let restored = turns.len();
    session.ledger.replace_history(turns);
    session.set_character_id(Some(memory.character_id.clone()));

    tracing::info!(session_id = %id, memory_id = %memory.id, restored, "restored conversation from memory");
    ok(json!({
        "session_id": id,
        "memory_id": memory.id,
        "restored_turns": restored,
    }))
}

// ── Token usage ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct UsageQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub(super) async fn handle_token_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> ApiResponse {
    if let Some(session_id) = &query.session_id {
        let Some(session) = state.sessions.get(session_id) else {
            return error_body(StatusCode::NOT_FOUND, "session not found");
        };
        let (total, history) = session.ledger.usage_snapshot();
        return ok(json!({
            "session_id": session_id,
            "total_tokens": total,
            "history": history,
            "warning": total > state.warning_threshold,
            "warning_threshold": state.warning_threshold,
        }));
    }

    let live_total: u64 = state.sessions.list().iter().map(|s| s.total_tokens).sum();
    let durable = match state.usage_log.summarize(None) {
        Ok(summary) => summary,
        Err(error) => return store_error_response(&error),
    };
    ok(json!({
        "total_tokens": live_total,
        "durable_total": durable.total_tokens,
        "record_count": durable.record_count,
        "warning": live_total > state.warning_threshold,
        "warning_threshold": state.warning_threshold,
    }))
}

pub(super) async fn handle_reset_tokens(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> ApiResponse {
    if let Some(session_id) = &query.session_id {
        let Some(session) = state.sessions.get(session_id) else {
            return error_body(StatusCode::NOT_FOUND, "session not found");
        };
        session.ledger.reset_token_usage();
        return ok(json!({ "message": "token usage reset", "session_id": session_id }));
    }

    for info in state.sessions.list() {
        if let Some(session) = state.sessions.get(&info.session_id) {
            session.ledger.reset_token_usage();
        }
    }
    if let Err(error) = state.usage_log.clear() {
        return store_error_response(&error);
    }
    ok(json!({ "message": "token usage reset" }))
}

// ── Memories ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct ListMemoriesQuery {
    #[serde(default)]
    pub sort_by: Option<MemorySort>,
    #[serde(default)]
    pub descending: Option<bool>,
}

pub(super) async fn handle_list_memories(
    State(state): State<AppState>,
    Query(query): Query<ListMemoriesQuery>,
) -> ApiResponse {
    let sort_by = query.sort_by.unwrap_or_default();
    let descending = query.descending.unwrap_or(true);
    match state.memories.list_all(sort_by, descending) {
        Ok(memories) => ok(json!(memories)),
        Err(error) => store_error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateMemoryRequest {
    #[serde(flatten)]
    pub fields: NewMemory,
    /// Snapshot this live session's conversation into the memory when
    /// no explicit snapshot was provided.
    #[serde(default)]
    pub from_session: Option<String>,
}

pub(super) async fn handle_create_memory(
    State(state): State<AppState>,
    Json(request): Json<CreateMemoryRequest>,
) -> ApiResponse {
    let mut fields = request.fields;
    if fields.conversation.is_empty() {
        if let Some(session_id) = &request.from_session {
            let Some(session) = state.sessions.get(session_id) else {
                return error_body(StatusCode::NOT_FOUND, "session not found");
            };
            fields.conversation = session.ledger.history_snapshot();
        }
    }

    match state.memories.create(fields) {
        Ok(id) => match state.memories.get(&id) {
            Ok(Some(memory)) => (StatusCode::CREATED, Json(json!(memory))),
            Ok(None) => error_body(StatusCode::INTERNAL_SERVER_ERROR, "memory vanished"),
            Err(error) => store_error_response(&error),
        },
        Err(error) => store_error_response(&error),
    }
}

pub(super) async fn handle_search_memories(
    State(state): State<AppState>,
    Query(filter): Query<MemoryFilter>,
) -> ApiResponse {
    match state.memories.search(&filter) {
        Ok(memories) => ok(json!(memories)),
        Err(error) => store_error_response(&error),
    }
}

pub(super) async fn handle_get_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse {
    match state.memories.get(&id) {
        Ok(Some(memory)) => ok(json!(memory)),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "memory not found"),
        Err(error) => store_error_response(&error),
    }
}

pub(super) async fn handle_update_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<MemoryPatch>,
) -> ApiResponse {
    match state.memories.update(&id, patch) {
        Ok(true) => ok(json!({ "message": "memory updated", "id": id })),
        Ok(false) => error_body(StatusCode::NOT_FOUND, "memory not found"),
        Err(error) => store_error_response(&error),
    }
}

pub(super) async fn handle_delete_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse {
    match state.memories.delete(&id) {
        Ok(true) => ok(json!({ "message": "memory deleted", "id": id })),
        Ok(false) => error_body(StatusCode::NOT_FOUND, "memory not found"),
        Err(error) => store_error_response(&error),
    }
}

// ── Personas ─────────────────────────────────────────────────────────

pub(super) async fn handle_list_personas(State(state): State<AppState>) -> Json<Value> {
    let active = state.personas.active().map(|p| p.id.clone());
    Json(json!({
        "personas": state.personas.list(),
        "active": active,
    }))
}

pub(super) async fn handle_create_persona(
    State(state): State<AppState>,
    Json(fields): Json<NewPersona>,
) -> ApiResponse {
    if fields.name.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "persona name must not be empty");
    }
    let persona = state.personas.create(fields);
    (StatusCode::CREATED, Json(json!(persona)))
}

pub(super) async fn handle_activate_persona(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse {
    if state.personas.activate(&id) {
        ok(json!({ "message": "persona activated", "id": id }))
    } else {
        error_body(StatusCode::NOT_FOUND, "persona not found")
    }
}

pub(super) async fn handle_delete_persona(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse {
    if state.personas.delete(&id) {
        ok(json!({ "message": "persona deleted", "id": id }))
    } else {
        error_body(StatusCode::NOT_FOUND, "persona not found")
    }
}
