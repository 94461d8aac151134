use thiserror::Error;

/// Errors raised by the job record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with the given id exists in `collection`.
    #[error("{collection} not found: {id}")]
    NotFound { collection: &'static str, id: String },

    /// The id cannot address any row (e.g. empty string).
    #[error("invalid id: {0:?}")]
    InvalidId(String),

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The blocking worker running the statement was cancelled or panicked.
    #[error("store worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
