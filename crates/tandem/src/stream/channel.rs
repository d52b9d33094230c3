//! Channel classification for session events.
//!
//! Event types are free-form string tags (`chunk`, `tool:start`,
//! `presence:joined`, ...). The channel is a coarse category derived from
//! the type so consumers can follow a subset of a session's activity.
//! Classification is pure: the same type always maps to the same channel,
//! whether computed at write time or at read time.

use serde::{Deserialize, Serialize};

/// Logical channel a session event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    /// Streaming model output (`chunk`).
    Chunks,
    /// Tool invocations (`tool:*`).
    ToolCalls,
    /// Terminal input/output (`terminal:*`).
    Terminal,
    /// User presence (`presence:*`).
    Presence,
    /// Approval requests and decisions (`approval:*`).
    Approval,
    /// Agent lifecycle (`agent:*`).
    Agent,
    /// Session state snapshots (`state:update`).
    State,
    /// Anything unrecognized.
    Other,
}

impl Channel {
    /// Classify an event type into its channel.
    ///
    /// Exact matches take priority over prefix matches; unknown types fall
    /// through to [`Channel::Other`].
    pub fn of(event_type: &str) -> Self {
        match event_type {
            "chunk" => return Channel::Chunks,
            "state:update" => return Channel::State,
            _ => {}
        }

        if event_type.starts_with("tool:") {
            Channel::ToolCalls
        } else if event_type.starts_with("terminal:") {
            Channel::Terminal
        } else if event_type.starts_with("presence:") {
            Channel::Presence
        } else if event_type.starts_with("approval:") {
            Channel::Approval
        } else if event_type.starts_with("agent:") {
            Channel::Agent
        } else {
            Channel::Other
        }
    }

    /// The wire name of this channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Chunks => "chunks",
            Channel::ToolCalls => "toolCalls",
            Channel::Terminal => "terminal",
            Channel::Presence => "presence",
            Channel::Approval => "approval",
            Channel::Agent => "agent",
            Channel::State => "state",
            Channel::Other => "other",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
