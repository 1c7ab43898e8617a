use daffodil_cache::PublishError;
use daffodil_core::{AttributeReadError, StoreError};
use daffodil_segmentation::CatalogError;
use thiserror::Error;

/// Failure of one recompute, sweep or event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaffodilError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    AttributeRead(#[from] AttributeReadError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("invalid order event: {0}")]
    InvalidEvent(String),
}

impl DaffodilError {
    /// Whether the same work may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            DaffodilError::Catalog(CatalogError::Store(e)) => e.is_retryable(),
            DaffodilError::AttributeRead(AttributeReadError::Store(e)) => e.is_retryable(),
            DaffodilError::AttributeRead(AttributeReadError::NotFound(_)) => false,
            DaffodilError::Publish(PublishError::RetriesExhausted { .. }) => true,
            DaffodilError::Publish(PublishError::Encode { .. }) => false,
            DaffodilError::Store(e) => e.is_retryable(),
            DaffodilError::Timeout { .. } => true,
            DaffodilError::InvalidEvent(_) => false,
        }
    }
}
