//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is accepting events and presence.
    Active,
    /// Session has been closed; publish and join are rejected.
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "closed" => Ok(SessionStatus::Closed),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

// Implement conversion from String for SQLx
impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A conversation session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// Project this session belongs to.
    pub project_id: String,
    /// Task the session was opened for, if any.
    pub task_id: Option<String>,
    /// Agent bound to the session, if any.
    pub agent_id: Option<String>,
    /// Human-readable title.
    pub title: String,
    /// Current session status.
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// When the session was created.
    pub created_at: String,
    /// When the session was last touched.
    pub updated_at: String,
    /// When the session was closed.
    pub closed_at: Option<String>,
}

impl Session {
    /// Check if the session still accepts publishes and joins.
    pub fn is_open(&self) -> bool {
        matches!(self.status, SessionStatus::Active)
    }
}

/// Request to create a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Project the session belongs to.
    pub project_id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: Option<String>,
    /// Task the session is opened for.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Agent bound to the session.
    #[serde(default)]
    pub agent_id: Option<String>,
}
