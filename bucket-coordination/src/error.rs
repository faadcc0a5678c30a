use thiserror::Error;

use crate::types::BucketId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bucket {bucket_id} is out of range, bucket count is {bucket_count}")]
    InvalidBucket {
        bucket_id: BucketId,
        bucket_count: u32,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("bucket manager is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Transient failures worth another attempt. Contract violations, corrupt
    /// values and lifecycle errors are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Unavailable(_) => true,
            Error::Etcd(e) => !matches!(e, etcd_client::Error::InvalidArgs(_)),
            Error::InvalidBucket { .. }
            | Error::InvalidArgument(_)
            | Error::Serde(_)
            | Error::InvalidState(_)
            | Error::RetriesExhausted { .. }
            | Error::Cancelled
            | Error::ShuttingDown => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
