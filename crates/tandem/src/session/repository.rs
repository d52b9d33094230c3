//! Session database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{CreateSessionRequest, Session, SessionStatus};

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new session.
    pub async fn create(&self, request: CreateSessionRequest) -> Result<Session> {
        let now = Utc::now().to_rfc3339();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            project_id: request.project_id,
            task_id: request.task_id,
            agent_id: request.agent_id,
            title: request.title.unwrap_or_else(|| "Untitled session".to_string()),
            status: SessionStatus::Active,
            created_at: now.clone(),
            updated_at: now,
            closed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, project_id, task_id, agent_id, title,
                status, created_at, updated_at, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.project_id)
        .bind(&session.task_id)
        .bind(&session.agent_id)
        .bind(&session.title)
        .bind(session.status.to_string())
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .bind(&session.closed_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(session)
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, project_id, task_id, agent_id, title,
                   status, created_at, updated_at, closed_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    /// List all sessions, newest first.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, project_id, task_id, agent_id, title,
                   status, created_at, updated_at, closed_at
            FROM sessions
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(sessions)
    }

    /// List sessions for a project, newest first.
    pub async fn list_by_project(&self, project_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, project_id, task_id, agent_id, title,
                   status, created_at, updated_at, closed_at
            FROM sessions
            WHERE project_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions by project")?;

        Ok(sessions)
    }

    /// Bump the session's updated_at timestamp.
    pub async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching session")?;

        Ok(())
    }

    /// Mark a session closed. Idempotent: closing a closed session keeps
    /// the original closed_at.
    pub async fn close(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'closed',
                closed_at = COALESCE(closed_at, ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("closing session")?;

        Ok(())
    }

    /// Delete a session.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(())
    }
}
