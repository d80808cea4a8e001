//! Error types for the forwarding bridge
//! Provides structured error handling using thiserror for better error reporting

use thiserror::Error;

use crate::pubsub::SubscriptionError;
use crate::sink::SinkError;
use crate::transform::TransformError;

/// Main error type for the forwarder
#[derive(Error, Debug)]
pub enum ForwarderError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Credential file errors, fatal at startup
    #[error("Credentials error: {message}")]
    Credentials { message: String },

    /// Event payload could not be transformed
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Downstream ingestion errors
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Upstream subscription errors
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// Lifecycle misuse, e.g. starting a subscriber twice
    #[error("Lifecycle error: {message}")]
    Lifecycle { message: String },

    /// Network/IO related errors
    #[error("IO error")]
    Io(#[from] std::io::Error),

    /// YAML decoding errors for the config file
    #[error("Config file decoding error")]
    Yaml(#[from] serde_yaml::Error),

    /// Task execution errors for async operations
    #[error("Task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    /// Generic error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience
pub type ForwarderResult<T> = std::result::Result<T, ForwarderError>;

impl ForwarderError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a credentials error
    pub fn credentials<S: Into<String>>(message: S) -> Self {
        Self::Credentials {
            message: message.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle<S: Into<String>>(message: S) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = ForwarderError::config("Azure LogType not provided");
        assert_eq!(
            err.to_string(),
            "Configuration error: Azure LogType not provided"
        );
    }

    #[test]
    fn test_sink_error_is_transparent() {
        let err: ForwarderError = SinkError::Status {
            status: 503,
            body: "throttled".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "error status 503: throttled");
    }
}
