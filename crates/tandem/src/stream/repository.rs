//! Durable event log and session summary storage.

use log::{debug, warn};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};

use super::error::{StreamError, StreamResult};
use super::models::{SessionEvent, SessionSummary};

/// Attempt bound for offset assignment. Losing the race for an offset this
/// many times in a row means the write is abandoned as SYNC_FAILED.
const MAX_PERSIST_ATTEMPTS: u32 = 3;

/// Raw event row; `data` is stored as a JSON string.
#[derive(Debug, FromRow)]
struct EventRow {
    id: String,
    session_id: String,
    offset: i64,
    #[sqlx(rename = "type")]
    event_type: String,
    data: String,
    timestamp: i64,
}

impl EventRow {
    fn into_event(self) -> StreamResult<SessionEvent> {
        let data: Value =
            serde_json::from_str(&self.data).map_err(|e| StreamError::Storage(sqlx::Error::Decode(Box::new(e))))?;
        Ok(SessionEvent {
            id: self.id,
            session_id: self.session_id,
            offset: Some(self.offset),
            event_type: self.event_type,
            data,
            timestamp: self.timestamp,
        })
    }
}

/// Raw summary row; `counters` is stored as a JSON string.
#[derive(Debug, FromRow)]
struct SummaryRow {
    session_id: String,
    last_offset: Option<i64>,
    counters: Option<String>,
    updated_at: String,
}

impl SummaryRow {
    fn into_summary(self) -> StreamResult<SessionSummary> {
        let counters = match self.counters {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| StreamError::Storage(sqlx::Error::Decode(Box::new(e))))?,
            ),
            None => None,
        };
        Ok(SessionSummary {
            session_id: self.session_id,
            last_offset: self.last_offset,
            counters,
            updated_at: self.updated_at,
        })
    }
}

/// Repository for the durable, offset-ordered event log.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event to the session's log, assigning the next offset.
    ///
    /// Offset assignment is optimistic: read the highest existing offset,
    /// insert at `last + 1`, and let the UNIQUE(session_id, "offset")
    /// constraint arbitrate concurrent writers. A constraint violation on
    /// the offset means another writer won that slot; recompute and retry,
    /// up to [`MAX_PERSIST_ATTEMPTS`]. The constraint is the single source
    /// of truth for "offset N is taken"; there is no lock.
    ///
    /// Returns the event with its assigned offset. A duplicate event id is
    /// NOT retried; producers that retry must reuse ids and callers
    /// deduplicate downstream.
    pub async fn persist(&self, event: &SessionEvent) -> StreamResult<SessionEvent> {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM sessions WHERE id = ?")
            .bind(&event.session_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StreamError::NotFound(event.session_id.clone()));
        }

        let data = event.data.to_string();

        for attempt in 1..=MAX_PERSIST_ATTEMPTS {
            let last: Option<i64> = sqlx::query_scalar(
                r#"SELECT MAX("offset") FROM session_events WHERE session_id = ?"#,
            )
            .bind(&event.session_id)
            .fetch_one(&self.pool)
            .await?;
            let candidate = last.map_or(0, |n| n + 1);

            let inserted = sqlx::query(
                r#"
                INSERT INTO session_events (id, session_id, "offset", type, data, timestamp)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.id)
            .bind(&event.session_id)
            .bind(candidate)
            .bind(&event.event_type)
            .bind(&data)
            .bind(event.timestamp)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    // Advisory; the log row is already durable, so a summary
                    // failure is logged rather than surfaced.
                    if let Err(err) = self.advance_summary(&event.session_id, candidate).await {
                        warn!(
                            "failed to advance summary for session {}: {}",
                            event.session_id, err
                        );
                    }

                    let mut persisted = event.clone();
                    persisted.offset = Some(candidate);
                    return Ok(persisted);
                }
                Err(err) if is_offset_conflict(&err) => {
                    debug!(
                        "offset {} for session {} taken by a concurrent writer, retrying ({}/{})",
                        candidate, event.session_id, attempt, MAX_PERSIST_ATTEMPTS
                    );
                }
                Err(err) => return Err(StreamError::Storage(err)),
            }
        }

        Err(StreamError::SyncFailed {
            attempts: MAX_PERSIST_ATTEMPTS,
        })
    }

    /// Fetch events with timestamp >= `since_millis`, ascending by offset.
    pub async fn fetch_since(
        &self,
        session_id: &str,
        since_millis: i64,
    ) -> StreamResult<Vec<SessionEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, session_id, "offset", type, data, timestamp
            FROM session_events
            WHERE session_id = ? AND timestamp >= ?
            ORDER BY "offset" ASC
            "#,
        )
        .bind(session_id)
        .bind(since_millis)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Fetch a page of events, ascending by offset.
    pub async fn list(
        &self,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> StreamResult<Vec<SessionEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, session_id, "offset", type, data, timestamp
            FROM session_events
            WHERE session_id = ?
            ORDER BY "offset" ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Count persisted events for a session.
    pub async fn count(&self, session_id: &str) -> StreamResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM session_events WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Get the summary for a session, if one has been created.
    pub async fn get_summary(&self, session_id: &str) -> StreamResult<Option<SessionSummary>> {
        let row = sqlx::query_as::<_, SummaryRow>(
            "SELECT session_id, last_offset, counters, updated_at FROM session_summaries WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SummaryRow::into_summary).transpose()
    }

    /// Merge counters into the session's summary, creating it if needed.
    ///
    /// Merging is key-by-key, last write wins per key. The summary's
    /// last_offset is never moved by this path.
    pub async fn merge_counters(
        &self,
        session_id: &str,
        counters: &Value,
    ) -> StreamResult<SessionSummary> {
        let merged = match self.get_summary(session_id).await? {
            Some(summary) => merge_counter_values(summary.counters, counters),
            None => merge_counter_values(None, counters),
        };
        let merged_raw = merged.to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO session_summaries (session_id, last_offset, counters, updated_at)
            VALUES (?, NULL, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                counters = excluded.counters,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(&merged_raw)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_summary(session_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(session_id.to_string()))
    }

    /// Move the summary's last_offset forward after a successful persist.
    ///
    /// The MAX() keeps concurrent touches monotonic: a slow writer can only
    /// ever leave last_offset where it is, never pull it backwards.
    async fn advance_summary(&self, session_id: &str, offset: i64) -> StreamResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session_summaries (session_id, last_offset, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                last_offset = MAX(COALESCE(last_offset, -1), excluded.last_offset),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(offset)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Whether an insert failed because the (session_id, offset) slot was
/// already taken. A duplicate primary key (event id) is a different
/// failure and must not be retried.
fn is_offset_conflict(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation() && db.message().contains("offset"))
        .unwrap_or(false)
}

fn merge_counter_values(existing: Option<Value>, incoming: &Value) -> Value {
    let mut base = match existing {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    if let Value::Object(update) = incoming {
        for (key, value) in update {
            base.insert(key.clone(), value.clone());
        }
    }
    Value::Object(base)
}
