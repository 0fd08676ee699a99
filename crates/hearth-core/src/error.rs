use std::io;

use thiserror::Error;

/// Central error type for the hearth server core.
#[derive(Debug, Error)]
pub enum HearthError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Rejected or unreadable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Credential store failure surfaced during startup.
    #[error("credential store error: {0}")]
    Store(#[from] hearth_store::StoreError),
}

pub type HearthResult<T> = Result<T, HearthError>;
