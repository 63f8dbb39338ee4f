use storeplane_core::StoreId;
use storeplane_db::DbError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store not found: {0}")]
    NotFound(String),

    #[error("version conflict on store {id}: expected version {expected_version}")]
    ConcurrencyConflict { id: StoreId, expected_version: i64 },

    #[error("store already exists: {0}")]
    AlreadyExists(String),

    #[error("unsupported engine: {0}")]
    UnsupportedEngine(String),

    #[error("storage unavailable: {0}")]
    Connection(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether this error reflects a failing dependency rather than a
    /// caller mistake. Only these count against circuit breakers.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Internal(_))
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConnectionFailed(_) | DbError::Pool(_) | DbError::Closed => {
                StoreError::Connection(e.to_string())
            }
            DbError::Query(_) | DbError::Decode(_) => StoreError::Internal(e.to_string()),
        }
    }
}
