//! API route definitions.

use axum::{
    Router,
    routing::{get, patch, post, put},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Tracing layer with request IDs and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        // Session lifecycle
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/{session_id}", get(handlers::get_session))
        .route("/sessions/{session_id}/close", post(handlers::close_session))
        // Event stream
        .route("/sessions/{session_id}/events", post(handlers::publish_event))
        .route("/sessions/{session_id}/events", get(handlers::list_events))
        .route("/sessions/{session_id}/history", get(handlers::get_history))
        .route("/sessions/{session_id}/stream", get(handlers::stream_events))
        // Presence
        .route("/sessions/{session_id}/presence", get(handlers::list_presence))
        .route("/sessions/{session_id}/presence", put(handlers::update_presence))
        .route(
            "/sessions/{session_id}/presence/join",
            post(handlers::join_presence),
        )
        .route(
            "/sessions/{session_id}/presence/leave",
            post(handlers::leave_presence),
        )
        // Session summary
        .route("/sessions/{session_id}/summary", get(handlers::get_summary))
        .route(
            "/sessions/{session_id}/summary",
            patch(handlers::update_summary),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}
