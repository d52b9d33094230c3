//! API request handlers.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::presence::{ActiveUser, CursorPosition, PresenceUpdate};
use crate::session::{CreateSessionRequest, Session};
use crate::stream::{
    Channel, PublishReceipt, PublishRequest, SessionEvent, SessionSummary, SubscribeOptions,
};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Interval between SSE keep-alive comments.
const SSE_KEEP_ALIVE_SECS: u64 = 15;

// ============================================================================
// Health
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Sessions
// ============================================================================

/// Query parameters for listing sessions.
#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Create a new session.
#[instrument(skip(state, request))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    if request.project_id.trim().is_empty() {
        return Err(ApiError::bad_request("project_id must be non-empty"));
    }

    let session = state.sessions.create(request).await?;
    info!(session_id = %session.id, project_id = %session.project_id, "Created session");
    Ok((StatusCode::CREATED, Json(session)))
}

/// List sessions, optionally filtered by project.
#[instrument(skip(state))]
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    let sessions = match query.project_id {
        Some(project_id) => state.sessions.list_by_project(&project_id).await?,
        None => state.sessions.list().await?,
    };
    Ok(Json(sessions))
}

/// Get a session by ID.
#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {}", session_id)))?;
    Ok(Json(session))
}

/// Close a session. Idempotent; tears down live subscriptions and presence.
#[instrument(skip(state))]
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {}", session_id)))?;

    state.sessions.close(&session_id).await?;
    state.stream.shutdown_session(&session_id);
    state.presence.clear_session(&session_id);

    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {}", session_id)))?;

    info!(session_id = %session_id, "Closed session");
    Ok(Json(session))
}

// ============================================================================
// Event stream
// ============================================================================

/// Query parameters for paginated event reads.
#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

/// Query parameters for history reads.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Epoch millis; defaults to 60 seconds ago.
    #[serde(default)]
    pub start_time: Option<i64>,
}

/// Query parameters for the SSE stream.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub include_history: Option<bool>,
    /// Restrict the stream to one channel (e.g. "chunks", "toolCalls").
    #[serde(default)]
    pub channel: Option<Channel>,
}

/// Publish an event onto a session's stream.
///
/// Returns 202: the event is accepted and live-delivered; durable
/// persistence completes in the background.
#[instrument(skip(state, request), fields(session_id = %session_id))]
pub async fn publish_event(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<PublishReceipt>)> {
    if request.event_type.trim().is_empty() {
        return Err(ApiError::bad_request("type must be non-empty"));
    }

    let receipt = state.stream.publish(&session_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Paginated, offset-ordered read of a session's log.
#[instrument(skip(state))]
pub async fn list_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<Vec<SessionEvent>>> {
    let events = state
        .stream
        .get_events(&session_id, query.limit, query.offset)
        .await?;
    Ok(Json(events))
}

/// Timestamp-windowed replay of a session's log.
#[instrument(skip(state))]
pub async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<SessionEvent>>> {
    let events = state
        .stream
        .get_history(&session_id, query.start_time)
        .await?;
    Ok(Json(events))
}

/// Attach to a session's event stream.
///
/// Returns an SSE stream: replayed history first (unless disabled), then
/// live events until the client disconnects or the session closes. A
/// `: ping` comment is sent periodically as a keep-alive.
#[instrument(skip(state))]
pub async fn stream_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let options = SubscribeOptions {
        start_time: query.start_time,
        include_history: query.include_history,
        channel: query.channel,
    };
    let stream = state.stream.subscribe(&session_id, options).await?;

    info!(session_id = %session_id, "Attached to session event stream");

    let sse_stream = tokio_stream::StreamExt::map(stream, |event| {
        match serde_json::to_string(&event) {
            Ok(json) => Ok(Event::default().data(json)),
            Err(e) => {
                warn!("Failed to serialize session event: {}", e);
                Ok(Event::default().data(format!(r#"{{"error":"{}"}}"#, e)))
            }
        }
    });

    Ok(Sse::new(sse_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEP_ALIVE_SECS))
            .text("ping"),
    ))
}

// ============================================================================
// Presence
// ============================================================================

/// Request naming a user for join/leave.
#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    pub user_id: String,
}

/// Request to update a user's presence state.
#[derive(Debug, Deserialize)]
pub struct UpdatePresenceRequest {
    pub user_id: String,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub active_file: Option<String>,
}

/// Join a session.
#[instrument(skip(state), fields(session_id = %session_id))]
pub async fn join_presence(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<PresenceRequest>,
) -> ApiResult<Json<ActiveUser>> {
    let user = state.presence.join(&session_id, &request.user_id).await?;
    Ok(Json(user))
}

/// Leave a session.
#[instrument(skip(state), fields(session_id = %session_id))]
pub async fn leave_presence(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<PresenceRequest>,
) -> ApiResult<StatusCode> {
    state.presence.leave(&session_id, &request.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Update cursor/file presence state.
#[instrument(skip(state, request), fields(session_id = %session_id))]
pub async fn update_presence(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdatePresenceRequest>,
) -> ApiResult<Json<ActiveUser>> {
    let update = PresenceUpdate {
        cursor: request.cursor,
        active_file: request.active_file,
    };
    let user = state
        .presence
        .update(&session_id, &request.user_id, update)
        .await?;
    Ok(Json(user))
}

/// List users currently active in a session.
#[instrument(skip(state))]
pub async fn list_presence(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<ActiveUser>>> {
    let users = state.presence.get_active_users(&session_id).await?;
    Ok(Json(users))
}

// ============================================================================
// Session summary
// ============================================================================

/// Request to merge counters into a session summary.
#[derive(Debug, Deserialize)]
pub struct UpdateSummaryRequest {
    #[serde(default)]
    pub counters: Value,
}

/// Get a session's summary.
#[instrument(skip(state))]
pub async fn get_summary(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    let summary = state
        .stream
        .get_summary(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no summary for session: {}", session_id)))?;
    Ok(Json(summary))
}

/// Merge counters into a session's summary.
#[instrument(skip(state, request))]
pub async fn update_summary(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateSummaryRequest>,
) -> ApiResult<Json<SessionSummary>> {
    if !request.counters.is_object() {
        return Err(ApiError::bad_request("counters must be a JSON object"));
    }

    let summary = state
        .stream
        .update_summary(&session_id, &request.counters)
        .await?;
    Ok(Json(summary))
}
