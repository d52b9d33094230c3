//! Application state shared across handlers.

use std::sync::Arc;

use crate::presence::PresenceService;
use crate::session::SessionRepository;
use crate::stream::StreamService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle repository.
    pub sessions: SessionRepository,
    /// Event stream service (durable log + live bus).
    pub stream: Arc<StreamService>,
    /// Presence tracker.
    pub presence: Arc<PresenceService>,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        sessions: SessionRepository,
        stream: Arc<StreamService>,
        presence: Arc<PresenceService>,
    ) -> Self {
        Self {
            sessions,
            stream,
            presence,
        }
    }
}
