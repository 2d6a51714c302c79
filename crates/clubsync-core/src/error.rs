//! Error taxonomy shared by every ClubSync crate.

use thiserror::Error;

/// All errors surfaced by the scheduling engine and its collaborators.
#[derive(Debug, Error)]
pub enum ClubSyncError {
    /// Invalid configuration or schedule window (e.g. empty days of week).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A task or entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A task with the same unique name already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The external data source failed (network error or non-success status).
    #[error("External fetch failed ({platform}): {message}")]
    ExternalFetch { platform: String, message: String },

    /// Job queue enqueue/dequeue failure.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Store read/write failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Another run of the same task holds the lease.
    #[error("Task {0} is already running")]
    AlreadyRunning(String),

    /// An operation exceeded its deadline.
    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClubSyncError {
    /// Shorthand for a missing task.
    pub fn task_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.to_string(),
        }
    }

    /// Shorthand for a missing entity.
    pub fn entity_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "entity",
            id: id.to_string(),
        }
    }

    /// Whether the error came from the external data source.
    pub fn is_external(&self) -> bool {
        matches!(self, Self::ExternalFetch { .. } | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ClubSyncError>;
