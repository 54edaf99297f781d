//! Caller-facing error taxonomy for the admin engines.

use crate::storage::DatabaseError;

pub type Result<T> = std::result::Result<T, AdminError>;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// Bad caller input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Sync already running, or a relay restart already in progress.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Peer relay or payment backend unreachable.
    #[error("External service error: {0}")]
    TransientExternal(String),

    #[error("Storage error: {0}")]
    Storage(DatabaseError),
}

impl From<DatabaseError> for AdminError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            DatabaseError::Conflict(what) => Self::Conflict(what),
            other => Self::Storage(other),
        }
    }
}
