//! Event stream error types.

use thiserror::Error;

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur during stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Session does not exist.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Session is closed; publish and join are disallowed.
    #[error("session is closed: {0}")]
    Closed(String),

    /// Durable persistence failed after bounded retries.
    #[error("failed to persist event after {attempts} attempts")]
    SyncFailed { attempts: u32 },

    /// Underlying storage error.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Internal error from a collaborating service.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::NotFound("sess-1".to_string());
        assert_eq!(err.to_string(), "session not found: sess-1");

        let err = StreamError::SyncFailed { attempts: 3 };
        assert_eq!(err.to_string(), "failed to persist event after 3 attempts");
    }
}
