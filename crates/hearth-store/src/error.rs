use thiserror::Error;

/// Central error type for the credential store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The pool was constructed with zero handles.
    #[error("credential pool has no connections")]
    Empty,
    /// The pool is shutting down; no further handles will be issued.
    #[error("credential pool is closed")]
    Closed,
    /// The backing table rejected or failed an operation.
    #[error("credential backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
