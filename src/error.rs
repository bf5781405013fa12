//! Error types for store access.

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while talking to the measurement store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store unreachable, either at startup or on a health check.
    #[error("Connection error after {attempts} attempt(s): {message}")]
    Connection { attempts: u32, message: String },

    /// Query or write failure reported by PostgreSQL.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (overflow cache file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The in-memory store is simulating an outage.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Invalid timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl StoreError {
    // ---
    pub fn connection(attempts: u32, message: impl Into<String>) -> Self {
        StoreError::Connection {
            attempts,
            message: message.into(),
        }
    }

    /// True for failures that a reconnect might cure.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection { .. } | StoreError::Unavailable(_))
    }
}
