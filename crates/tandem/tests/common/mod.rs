//! Test utilities and common setup.

use axum::Router;
use std::sync::Arc;
use tandem::api::{self, AppState};
use tandem::db::Database;
use tandem::presence::PresenceService;
use tandem::session::SessionRepository;
use tandem::stream::{EventRepository, LiveBus, StreamService};

/// Create a test application with all services initialized.
pub async fn test_app() -> Router {
    // Use in-memory database for tests
    let db = Database::in_memory().await.unwrap();

    let sessions = SessionRepository::new(db.pool().clone());
    let events = EventRepository::new(db.pool().clone());
    let bus = Arc::new(LiveBus::new());

    let stream = Arc::new(StreamService::new(sessions.clone(), events, bus));
    let presence = Arc::new(PresenceService::new(sessions.clone(), stream.clone()));

    let state = AppState::new(sessions, stream, presence);
    api::create_router(state)
}
