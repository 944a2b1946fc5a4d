use courier_shared::IdError;
use thiserror::Error;

/// Errors produced by the store layer and the message engine.
///
/// The first four variants are the domain taxonomy callers act on; the rest
/// are infrastructure failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Either party blocks the other.
    #[error("Messaging restricted")]
    Restricted,

    /// A user, message, conversation, reply target or membership is missing.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Ownership or membership mismatch.
    #[error("Forbidden: {0}")]
    Forbidden(&'static str),

    /// Malformed identifiers, cursors or message text.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The aggregate changed between read and conditional write.
    #[error("Concurrent update of {0}")]
    Conflict(&'static str),

    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// No pooled connection could be handed out.
    #[error("Connection pool error: {0}")]
    Pool(String),
}

impl From<IdError> for StoreError {
    fn from(err: IdError) -> Self {
        StoreError::InvalidArgument(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
