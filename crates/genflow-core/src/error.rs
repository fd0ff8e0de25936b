use thiserror::Error;

use crate::domain::{RoutingError, UnknownName};
use crate::queue::QueueError;

/// Failure of a backing store (counter store, event log, stage store, ledger).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Parse(#[from] UnknownName),

    #[error("{0}")]
    Other(String),
}
