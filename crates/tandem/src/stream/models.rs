//! Event stream data models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::channel::Channel;

/// A single event on a session's stream.
///
/// `offset` is the authoritative ordering key, assigned by the durable log
/// at persist time. Events observed live before (or without) durable
/// assignment carry `offset: None`; replayed events always carry it.
/// `timestamp` is producer-assigned epoch millis and is never used for
/// ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Unique event ID.
    pub id: String,
    /// Session this event belongs to.
    pub session_id: String,
    /// Gapless per-session sequence number, assigned at persist time.
    pub offset: Option<i64>,
    /// Event type tag, e.g. "chunk" or "tool:start".
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producer-defined payload.
    pub data: Value,
    /// Producer-assigned epoch millis.
    pub timestamp: i64,
}

impl SessionEvent {
    /// The logical channel this event belongs to, derived from its type.
    pub fn channel(&self) -> Channel {
        Channel::of(&self.event_type)
    }
}

/// Request to publish an event onto a session's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Producer-assigned event ID. Generated when absent. Producers that
    /// retry must reuse the same ID so consumers can deduplicate.
    #[serde(default)]
    pub id: Option<String>,
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producer-defined payload.
    #[serde(default)]
    pub data: Value,
    /// Epoch millis; stamped at publish time when absent.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Acknowledgement returned by `publish`.
///
/// Durability is deferred, so there is no offset here: the durable offset
/// does not exist yet when publish returns. It becomes observable on the
/// live stream, via `get_events`, or via the session summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// ID of the accepted event.
    pub event_id: String,
    /// Timestamp stamped on the event.
    pub timestamp: i64,
}

/// Per-session aggregate, updated as a side effect of every persisted
/// event. Advisory: the log's own offset column is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session this summary belongs to.
    pub session_id: String,
    /// Highest offset known to have been persisted, if any event has been.
    pub last_offset: Option<i64>,
    /// Free-form counters, merged key-by-key on update.
    pub counters: Option<Value>,
    /// When the summary was last touched.
    pub updated_at: String,
}
