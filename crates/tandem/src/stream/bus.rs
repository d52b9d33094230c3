//! In-memory live bus for per-session event fan-out.
//!
//! The bus has no persistence of its own: a subscriber attached when an
//! event is published receives it, one that attaches later does not.
//! Callers that need completeness use the replay+live merge in
//! `StreamService::subscribe`.

use dashmap::DashMap;
use log::debug;
use tokio::sync::broadcast;

use super::models::SessionEvent;

/// Size of each per-session broadcast buffer. A subscriber that falls more
/// than this many events behind is disconnected rather than allowed to
/// stall the session.
const SESSION_BUFFER_SIZE: usize = 256;

/// Live publish/subscribe bus, one broadcast channel per session.
pub struct LiveBus {
    channels: DashMap<String, broadcast::Sender<SessionEvent>>,
}

impl LiveBus {
    /// Create a new bus.
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Broadcast an event to all current subscribers of its session.
    ///
    /// Returns the number of subscribers the event was delivered to. Never
    /// blocks: subscribers own bounded buffers and lag is their problem.
    pub fn publish(&self, event: &SessionEvent) -> usize {
        let Some(tx) = self.channels.get(&event.session_id) else {
            return 0;
        };

        match tx.send(event.clone()) {
            Ok(receivers) => receivers,
            // No receivers attached; the event is simply not live-delivered.
            Err(_) => 0,
        }
    }

    /// Attach a new subscriber to a session.
    ///
    /// The receiver observes every event published after this call, in
    /// publish order, until it is dropped or falls behind the buffer.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!("creating live channel for session {}", session_id);
                let (tx, _) = broadcast::channel(SESSION_BUFFER_SIZE);
                tx
            })
            .subscribe()
    }

    /// Number of subscribers currently attached to a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Tear down a session's channel, ending all attached subscribers.
    pub fn remove(&self, session_id: &str) {
        if self.channels.remove(session_id).is_some() {
            debug!("removed live channel for session {}", session_id);
        }
    }
}

impl Default for LiveBus {
    fn default() -> Self {
        Self::new()
    }
}
