//! Stream service: the publish path and the replay+live subscription.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::Stream;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::{Session, SessionRepository};

use super::bus::LiveBus;
use super::channel::Channel;
use super::error::{StreamError, StreamResult};
use super::models::{PublishReceipt, PublishRequest, SessionEvent, SessionSummary};
use super::repository::EventRepository;

/// Size of each per-session writer queue. Producers briefly wait for queue
/// space when the writer falls behind; they never wait for durability.
const WRITER_QUEUE_SIZE: usize = 256;

/// Size of the per-subscriber delivery buffer.
const SUBSCRIBER_BUFFER_SIZE: usize = 64;

/// History window used when a subscriber gives no start time.
const DEFAULT_HISTORY_WINDOW_MS: i64 = 60_000;

/// Options for [`StreamService::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Replay events with timestamp >= this epoch-millis value.
    /// Defaults to now minus 60 seconds.
    pub start_time: Option<i64>,
    /// Whether to replay history before going live. Defaults to true.
    pub include_history: Option<bool>,
    /// Only deliver events on this channel. Defaults to every channel.
    pub channel: Option<Channel>,
}

/// A consumer's live handle on a session's stream.
///
/// Yields replayed history (ascending offset) followed by live events in
/// publish order, until the consumer drops or cancels it, the session is
/// closed, or the consumer falls too far behind the live buffer.
pub struct EventStream {
    rx: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Receive the next event, or None when the stream has ended.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Cancel the subscription, detaching from the live bus.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SessionEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Service tying the durable log and the live bus together.
///
/// One writer task per session serializes persistence, so within a server
/// process live delivery order, durable offsets and the log agree. The
/// UNIQUE(session_id, "offset") constraint in the log remains the backstop
/// when several processes share a database.
pub struct StreamService {
    sessions: SessionRepository,
    events: EventRepository,
    bus: Arc<LiveBus>,
    writers: DashMap<String, mpsc::Sender<SessionEvent>>,
}

impl StreamService {
    /// Create a new stream service.
    pub fn new(sessions: SessionRepository, events: EventRepository, bus: Arc<LiveBus>) -> Self {
        Self {
            sessions,
            events,
            bus,
            writers: DashMap::new(),
        }
    }

    /// Publish an event onto a session's stream.
    ///
    /// Validates the session before any side effect, stamps id and
    /// timestamp, and hands the event to the session's writer. Returns as
    /// soon as the event is queued: durable persistence happens in the
    /// background and its failure is logged, never surfaced here.
    pub async fn publish(
        &self,
        session_id: &str,
        request: PublishRequest,
    ) -> StreamResult<PublishReceipt> {
        let session = self.require_session(session_id).await?;
        if !session.is_open() {
            return Err(StreamError::Closed(session_id.to_string()));
        }

        let event = SessionEvent {
            id: request.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id: session_id.to_string(),
            offset: None,
            event_type: request.event_type,
            data: request.data,
            timestamp: request.timestamp.unwrap_or_else(now_millis),
        };
        let receipt = PublishReceipt {
            event_id: event.id.clone(),
            timestamp: event.timestamp,
        };

        let tx = self.writer(session_id);
        if tx.send(event).await.is_err() {
            // Session was shut down between validation and enqueue.
            warn!(
                "writer for session {} is gone, dropping event {}",
                session_id, receipt.event_id
            );
        }

        Ok(receipt)
    }

    /// Subscribe to a session's stream.
    ///
    /// Attaches to the live bus BEFORE reading history, so nothing
    /// published during the replay can be missed; the overlap between the
    /// two is deduplicated by event id. A closed session yields its
    /// history and then ends. An optional channel narrows delivery to one
    /// category of events.
    pub async fn subscribe(
        &self,
        session_id: &str,
        options: SubscribeOptions,
    ) -> StreamResult<EventStream> {
        let session = self.require_session(session_id).await?;
        let include_history = options.include_history.unwrap_or(true);
        let start_time = options
            .start_time
            .unwrap_or_else(|| now_millis() - DEFAULT_HISTORY_WINDOW_MS);
        let channel = options.channel;

        let live_rx = session.is_open().then(|| self.bus.subscribe(session_id));

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();
        let events = self.events.clone();
        let sid = session_id.to_string();

        tokio::spawn(async move {
            let mut replayed: HashSet<String> = HashSet::new();
            let wanted = |event: &SessionEvent| channel.is_none_or(|c| event.channel() == c);

            if include_history {
                match events.fetch_since(&sid, start_time).await {
                    Ok(history) => {
                        for event in history {
                            replayed.insert(event.id.clone());
                            if wanted(&event) && tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        warn!("failed to replay history for session {}: {}", sid, err);
                        return;
                    }
                }
            }

            let Some(mut live_rx) = live_rx else {
                return;
            };

            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    received = live_rx.recv() => match received {
                        Ok(event) => {
                            // Already delivered during replay.
                            if replayed.remove(&event.id) {
                                continue;
                            }
                            if !wanted(&event) {
                                continue;
                            }
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                "subscriber on session {} lagged by {} events, dropping it",
                                sid, skipped
                            );
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("subscriber detached from session {}", sid);
        });

        Ok(EventStream { rx, cancel })
    }

    /// Fetch events with timestamp >= start_time (default: last 60s),
    /// ascending by offset.
    pub async fn get_history(
        &self,
        session_id: &str,
        start_time: Option<i64>,
    ) -> StreamResult<Vec<SessionEvent>> {
        self.require_session(session_id).await?;
        let since = start_time.unwrap_or_else(|| now_millis() - DEFAULT_HISTORY_WINDOW_MS);
        self.events.fetch_since(session_id, since).await
    }

    /// Fetch a page of a session's log, ascending by offset.
    pub async fn get_events(
        &self,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> StreamResult<Vec<SessionEvent>> {
        self.require_session(session_id).await?;
        self.events
            .list(session_id, limit.clamp(1, 1000), offset.max(0))
            .await
    }

    /// Get the session's summary, if any event has created one.
    pub async fn get_summary(&self, session_id: &str) -> StreamResult<Option<SessionSummary>> {
        self.require_session(session_id).await?;
        self.events.get_summary(session_id).await
    }

    /// Merge counters into the session's summary.
    pub async fn update_summary(
        &self,
        session_id: &str,
        counters: &Value,
    ) -> StreamResult<SessionSummary> {
        self.require_session(session_id).await?;
        self.events.merge_counters(session_id, counters).await
    }

    /// Number of live subscribers currently attached to a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.bus.subscriber_count(session_id)
    }

    /// Tear down a session's live machinery after it is closed: the writer
    /// drains its queue and stops, and attached subscribers see their
    /// streams end.
    pub fn shutdown_session(&self, session_id: &str) {
        self.writers.remove(session_id);
        self.bus.remove(session_id);
    }

    async fn require_session(&self, session_id: &str) -> StreamResult<Session> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(session_id.to_string()))
    }

    /// Get or lazily spawn the session's writer task.
    fn writer(&self, session_id: &str) -> mpsc::Sender<SessionEvent> {
        if let Some(tx) = self.writers.get(session_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        match self.writers.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    let tx = self.spawn_writer(session_id.to_string());
                    occupied.insert(tx.clone());
                    tx
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let tx = self.spawn_writer(session_id.to_string());
                vacant.insert(tx.clone());
                tx
            }
        }
    }

    fn spawn_writer(&self, session_id: String) -> mpsc::Sender<SessionEvent> {
        let (tx, mut rx) = mpsc::channel::<SessionEvent>(WRITER_QUEUE_SIZE);
        let events = self.events.clone();
        let bus = self.bus.clone();

        tokio::spawn(async move {
            debug!("writer started for session {}", session_id);
            while let Some(event) = rx.recv().await {
                match events.persist(&event).await {
                    Ok(persisted) => {
                        bus.publish(&persisted);
                    }
                    Err(err) => {
                        // Best-effort durability: the event stays live-only.
                        // Subscribers may see it now and never again in replay.
                        warn!(
                            "failed to persist event {} for session {}: {} (delivering live only)",
                            event.id, session_id, err
                        );
                        bus.publish(&event);
                    }
                }
            }
            debug!("writer stopped for session {}", session_id);
        });

        tx
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::session::CreateSessionRequest;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn setup() -> (Database, Arc<LiveBus>, Arc<StreamService>, String) {
        let db = Database::in_memory().await.unwrap();
        let sessions = SessionRepository::new(db.pool().clone());
        let session = sessions
            .create(CreateSessionRequest {
                project_id: "proj-1".to_string(),
                title: None,
                task_id: None,
                agent_id: None,
            })
            .await
            .unwrap();
        let bus = Arc::new(LiveBus::new());
        let events = EventRepository::new(db.pool().clone());
        let service = Arc::new(StreamService::new(sessions, events, bus.clone()));
        (db, bus, service, session.id)
    }

    fn chunk(data: &str) -> PublishRequest {
        PublishRequest {
            id: None,
            event_type: "chunk".to_string(),
            data: json!(data),
            timestamp: None,
        }
    }

    async fn wait_for_persisted(service: &StreamService, session_id: &str, count: usize) {
        for _ in 0..100 {
            let events = service.get_events(session_id, 1000, 0).await.unwrap();
            if events.len() >= count {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} persisted events for session {}", count, session_id);
    }

    #[tokio::test]
    async fn test_publish_unknown_session() {
        let (_db, _bus, service, _sid) = setup().await;
        let err = service.publish("nope", chunk("a")).await.unwrap_err();
        assert!(matches!(err, StreamError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_closed_session() {
        let (db, _bus, service, session_id) = setup().await;
        SessionRepository::new(db.pool().clone())
            .close(&session_id)
            .await
            .unwrap();

        let err = service.publish(&session_id, chunk("a")).await.unwrap_err();
        assert!(matches!(err, StreamError::Closed(_)));
    }

    #[tokio::test]
    async fn test_publish_persists_in_order() {
        let (_db, _bus, service, session_id) = setup().await;

        for data in ["a", "b", "c"] {
            service.publish(&session_id, chunk(data)).await.unwrap();
        }
        wait_for_persisted(&service, &session_id, 3).await;

        let events = service.get_events(&session_id, 10, 0).await.unwrap();
        let offsets: Vec<i64> = events.iter().map(|e| e.offset.unwrap()).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        let payloads: Vec<&Value> = events.iter().map(|e| &e.data).collect();
        assert_eq!(payloads, vec![&json!("a"), &json!("b"), &json!("c")]);
    }

    #[tokio::test]
    async fn test_subscribe_fresh_session_sees_only_live() {
        let (_db, _bus, service, session_id) = setup().await;

        let mut stream = service
            .subscribe(&session_id, SubscribeOptions::default())
            .await
            .unwrap();

        service.publish(&session_id, chunk("first")).await.unwrap();
        service.publish(&session_id, chunk("second")).await.unwrap();

        let first = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.data, json!("first"));
        assert_eq!(first.offset, Some(0));

        let second = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.data, json!("second"));
        assert_eq!(second.offset, Some(1));
    }

    #[tokio::test]
    async fn test_subscribe_replays_history_then_goes_live() {
        let (_db, _bus, service, session_id) = setup().await;

        service.publish(&session_id, chunk("old")).await.unwrap();
        wait_for_persisted(&service, &session_id, 1).await;

        let mut stream = service
            .subscribe(
                &session_id,
                SubscribeOptions {
                    start_time: Some(0),
                    include_history: None,
                    channel: None,
                },
            )
            .await
            .unwrap();

        let replayed = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed.data, json!("old"));

        service.publish(&session_id, chunk("new")).await.unwrap();
        let live = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.data, json!("new"));
    }

    #[tokio::test]
    async fn test_subscribe_without_history() {
        let (_db, _bus, service, session_id) = setup().await;

        service.publish(&session_id, chunk("old")).await.unwrap();
        wait_for_persisted(&service, &session_id, 1).await;

        let mut stream = service
            .subscribe(
                &session_id,
                SubscribeOptions {
                    start_time: Some(0),
                    include_history: Some(false),
                    channel: None,
                },
            )
            .await
            .unwrap();

        service.publish(&session_id, chunk("live")).await.unwrap();
        let event = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.data, json!("live"));
    }

    #[tokio::test]
    async fn test_handoff_overlap_is_deduplicated() {
        let (_db, bus, service, session_id) = setup().await;

        service.publish(&session_id, chunk("seen")).await.unwrap();
        wait_for_persisted(&service, &session_id, 1).await;
        let persisted = service.get_events(&session_id, 10, 0).await.unwrap();

        let mut stream = service
            .subscribe(
                &session_id,
                SubscribeOptions {
                    start_time: Some(0),
                    include_history: None,
                    channel: None,
                },
            )
            .await
            .unwrap();

        let replayed = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed.id, persisted[0].id);

        // The same event arriving live (as in the replay/attach overlap
        // window) must not be delivered twice.
        bus.publish(&persisted[0]);
        service.publish(&session_id, chunk("after")).await.unwrap();

        let next = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.data, json!("after"));
    }

    #[tokio::test]
    async fn test_channel_filter_narrows_delivery() {
        let (_db, _bus, service, session_id) = setup().await;

        let mut stream = service
            .subscribe(
                &session_id,
                SubscribeOptions {
                    start_time: None,
                    include_history: Some(false),
                    channel: Some(Channel::ToolCalls),
                },
            )
            .await
            .unwrap();

        service.publish(&session_id, chunk("noise")).await.unwrap();
        service
            .publish(
                &session_id,
                PublishRequest {
                    id: None,
                    event_type: "tool:start".to_string(),
                    data: json!({"tool": "bash"}),
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "tool:start");
    }

    #[tokio::test]
    async fn test_cancel_detaches_subscriber() {
        let (_db, _bus, service, session_id) = setup().await;

        let stream = service
            .subscribe(&session_id, SubscribeOptions::default())
            .await
            .unwrap();
        // The pump attaches before subscribe returns.
        assert_eq!(service.subscriber_count(&session_id), 1);

        stream.cancel();
        for _ in 0..100 {
            if service.subscriber_count(&session_id) == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber still attached after cancel");
    }

    #[tokio::test]
    async fn test_closed_session_subscribe_is_replay_only() {
        let (db, _bus, service, session_id) = setup().await;

        service.publish(&session_id, chunk("before-close")).await.unwrap();
        wait_for_persisted(&service, &session_id, 1).await;

        SessionRepository::new(db.pool().clone())
            .close(&session_id)
            .await
            .unwrap();
        service.shutdown_session(&session_id);

        let mut stream = service
            .subscribe(
                &session_id,
                SubscribeOptions {
                    start_time: Some(0),
                    include_history: None,
                    channel: None,
                },
            )
            .await
            .unwrap();

        let replayed = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replayed.data, json!("before-close"));

        // Stream ends instead of waiting for live events.
        let end = timeout(Duration::from_secs(1), stream.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_summary_tracks_published_events() {
        let (_db, _bus, service, session_id) = setup().await;

        assert!(service.get_summary(&session_id).await.unwrap().is_none());

        service.publish(&session_id, chunk("a")).await.unwrap();
        service.publish(&session_id, chunk("b")).await.unwrap();
        wait_for_persisted(&service, &session_id, 2).await;

        let summary = service.get_summary(&session_id).await.unwrap().unwrap();
        assert_eq!(summary.last_offset, Some(1));

        let updated = service
            .update_summary(&session_id, &json!({"chunks": 2}))
            .await
            .unwrap();
        assert_eq!(updated.last_offset, Some(1));
        assert_eq!(updated.counters.unwrap()["chunks"], 2);
    }
}
