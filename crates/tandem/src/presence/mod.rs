//! Ephemeral per-session presence tracking.
//!
//! Presence is never persisted: it lives in an in-process map owned by the
//! service, keyed (session, user). Every transition also publishes a
//! `presence:*` event onto the session stream, so any stream subscriber
//! observes joins, cursor moves and leaves without a presence-specific
//! feed. Users that stop heartbeating are evicted by a lease sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::session::SessionRepository;
use crate::stream::{PublishRequest, StreamError, StreamResult, StreamService};

/// A cursor position within a shared editor/canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// An active participant in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveUser {
    /// User ID.
    pub user_id: String,
    /// Epoch millis of the last join/update from this user.
    pub last_seen: i64,
    /// Last reported cursor position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    /// File the user is currently viewing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_file: Option<String>,
}

/// Fields a presence update may change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresenceUpdate {
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub active_file: Option<String>,
}

/// Tracks who is active in each session.
pub struct PresenceService {
    sessions: SessionRepository,
    stream: Arc<StreamService>,
    active: DashMap<String, HashMap<String, ActiveUser>>,
}

impl PresenceService {
    /// Create a new presence service.
    pub fn new(sessions: SessionRepository, stream: Arc<StreamService>) -> Self {
        Self {
            sessions,
            stream,
            active: DashMap::new(),
        }
    }

    /// Mark a user active in a session. Re-joining refreshes last_seen and
    /// keeps previously reported cursor state.
    pub async fn join(&self, session_id: &str, user_id: &str) -> StreamResult<ActiveUser> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(session_id.to_string()))?;
        if !session.is_open() {
            return Err(StreamError::Closed(session_id.to_string()));
        }

        let user = {
            let mut users = self.active.entry(session_id.to_string()).or_default();
            let entry = users
                .entry(user_id.to_string())
                .or_insert_with(|| ActiveUser {
                    user_id: user_id.to_string(),
                    last_seen: 0,
                    cursor: None,
                    active_file: None,
                });
            entry.last_seen = now_millis();
            entry.clone()
        };

        info!("user {} joined session {}", user_id, session_id);
        self.publish_presence(session_id, "presence:joined", json!({"user_id": user_id}))
            .await;

        Ok(user)
    }

    /// Remove a user from a session. Leaving a session the user is not in
    /// is a no-op.
    pub async fn leave(&self, session_id: &str, user_id: &str) -> StreamResult<()> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(session_id.to_string()))?;

        let removed = self
            .active
            .get_mut(session_id)
            .map(|mut users| users.remove(user_id).is_some())
            .unwrap_or(false);

        if removed {
            info!("user {} left session {}", user_id, session_id);
            self.publish_presence(session_id, "presence:left", json!({"user_id": user_id}))
                .await;
        }

        Ok(())
    }

    /// Update a user's cursor/file state. The user must have joined first.
    pub async fn update(
        &self,
        session_id: &str,
        user_id: &str,
        update: PresenceUpdate,
    ) -> StreamResult<ActiveUser> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(session_id.to_string()))?;

        let user = {
            let mut users = self
                .active
                .get_mut(session_id)
                .ok_or_else(|| StreamError::NotFound(format!("user {} in session {}", user_id, session_id)))?;
            let entry = users.get_mut(user_id).ok_or_else(|| {
                StreamError::NotFound(format!("user {} in session {}", user_id, session_id))
            })?;

            if let Some(cursor) = update.cursor {
                entry.cursor = Some(cursor);
            }
            if let Some(active_file) = update.active_file {
                entry.active_file = Some(active_file);
            }
            entry.last_seen = now_millis();
            entry.clone()
        };

        self.publish_presence(
            session_id,
            "presence:cursor",
            json!({
                "user_id": user_id,
                "cursor": user.cursor,
                "active_file": user.active_file,
            }),
        )
        .await;

        Ok(user)
    }

    /// Everyone currently active in a session.
    pub async fn get_active_users(&self, session_id: &str) -> StreamResult<Vec<ActiveUser>> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(session_id.to_string()))?;

        let mut users: Vec<ActiveUser> = self
            .active
            .get(session_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(users)
    }

    /// Evict users whose last_seen is older than `max_idle`, publishing a
    /// `presence:left` event for each. Returns the number evicted.
    ///
    /// This is the lease backstop for clients that crash without sending
    /// an explicit leave.
    pub async fn prune_idle(&self, max_idle: Duration) -> usize {
        let deadline = now_millis() - max_idle.as_millis() as i64;
        let mut evicted: Vec<(String, String)> = Vec::new();

        for mut entry in self.active.iter_mut() {
            let session_id = entry.key().clone();
            entry.value_mut().retain(|user_id, user| {
                if user.last_seen < deadline {
                    evicted.push((session_id.clone(), user_id.clone()));
                    false
                } else {
                    true
                }
            });
        }
        self.active.retain(|_, users| !users.is_empty());

        for (session_id, user_id) in &evicted {
            debug!(
                "presence lease expired for user {} in session {}",
                user_id, session_id
            );
            self.publish_presence(
                session_id,
                "presence:left",
                json!({"user_id": user_id, "reason": "expired"}),
            )
            .await;
        }

        evicted.len()
    }

    /// Drop all presence state for a session (used on session close).
    pub fn clear_session(&self, session_id: &str) {
        self.active.remove(session_id);
    }

    async fn publish_presence(&self, session_id: &str, event_type: &str, data: serde_json::Value) {
        let request = PublishRequest {
            id: None,
            event_type: event_type.to_string(),
            data,
            timestamp: None,
        };
        if let Err(err) = self.stream.publish(session_id, request).await {
            // Presence state is already mutated; the stream event is
            // best-effort (the session may be racing a close).
            warn!(
                "failed to publish {} for session {}: {}",
                event_type, session_id, err
            );
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
