//! Configuration error type

/// Errors raised while building a [`ClientConfig`](crate::ClientConfig).
///
/// These are fatal at startup and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing store endpoint list")]
    MissingEndpoints,

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("failed to load configuration: {0}")]
    Source(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ConfigError::MissingEndpoints.to_string(),
            "missing store endpoint list"
        );
        assert_eq!(
            ConfigError::InvalidEndpoint("http://".to_string()).to_string(),
            "invalid endpoint 'http://'"
        );

        let err = ConfigError::InvalidSetting {
            key: "session_ttl",
            reason: "must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid setting session_ttl: must be positive"
        );
    }
}
