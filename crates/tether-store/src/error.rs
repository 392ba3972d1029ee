//! Store error types

use crate::model::{LeaseId, Revision};

/// Errors returned by a [`StoreGateway`](crate::StoreGateway).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned error: code={code}, message={message}")]
    Status { code: i32, message: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("lease {0:x} not found")]
    LeaseNotFound(LeaseId),

    #[error("lease TTL must be positive, got {0}")]
    InvalidTtl(i64),

    #[error("required revision {requested} has been compacted (compact revision {compacted})")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    #[error("stream closed")]
    Closed,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
