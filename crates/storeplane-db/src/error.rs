//! Error types for the data-access layer.

use thiserror::Error;

/// Result type alias for data-access operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in the connection manager and node pools.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to create pool: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("row decode failed: {0}")]
    Decode(String),

    /// All retry attempts exhausted and failover handling has run.
    #[error("storage unavailable after retries: {0}")]
    ConnectionFailed(String),

    #[error("connection manager is closed")]
    Closed,
}
