//! Error types for vellum-sync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid sync token: {0}")]
    BadToken(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Session has read-only access")]
    ReadOnly,

    #[error("Conflicting item: {0}")]
    ConflictingItem(String),

    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the caller may safely retry the operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}
