//! Client error types for Tether

use std::time::Duration;

use tether_common::ConfigError;
use tether_store::{LeaseId, StoreError};

/// Error type for coordination operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("backend unavailable: {0}")]
    Backend(#[from] StoreError),

    #[error("request timeout after {0:?}")]
    Timeout(Duration),

    #[error("no locker created")]
    NoLocker,

    #[error("lock {key} still held by {holder:?} after {attempts} attempts")]
    Contended {
        key: String,
        holder: String,
        attempts: u64,
    },

    #[error("lease {0:x} lost")]
    LeaseLost(LeaseId),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
