use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the admission-control subsystem
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Remote store timed out during {0}")]
    Timeout(String),

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether this error came from the shared counter store rather than
    /// from local configuration.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            RateLimitError::Redis(_) | RateLimitError::Timeout(_) | RateLimitError::RemoteUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_classification() {
        assert!(RateLimitError::Timeout("INCR".to_string()).is_remote());
        assert!(RateLimitError::RemoteUnavailable("down".to_string()).is_remote());
        assert!(!RateLimitError::Config("bad".to_string()).is_remote());
        assert!(!RateLimitError::UnknownOperation("nope".to_string()).is_remote());
    }

    #[test]
    fn test_error_display() {
        let err = RateLimitError::UnknownOperation("teleport".to_string());
        assert_eq!(err.to_string(), "Unknown operation: teleport");
    }
}
