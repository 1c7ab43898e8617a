use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure talking to a backing store (metric store, segment store).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0} ms")]
    Timeout(u64),

    #[error("failed to decode store row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Failure reading one user's attribute row.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttributeReadError {
    #[error("no metrics row for user {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}
