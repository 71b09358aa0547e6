//! Crate-level error types.
//!
//! Errors here never reach the proxy's capture callbacks. The forwarder
//! logs and counts them; only construction-time failures (bad configuration,
//! a transport that cannot bind) are surfaced to the caller.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors produced while configuring or starting the forwarder.
#[derive(Debug, Error)]
pub enum FlowtapError {
    /// Configuration value rejected by validation
    #[error("Invalid configuration: {details}")]
    Config {
        /// What was wrong
        details: String,
    },

    /// Outbound transport could not be opened or used
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A request URL could not be parsed
    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        /// The offending input
        url: String,
        /// Parser error
        #[source]
        source: url::ParseError,
    },

    /// Metrics registration failed
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Global tracing subscriber could not be installed
    #[error("Logging initialisation failed: {details}")]
    Logging {
        /// Error details
        details: String,
    },

    /// Filesystem or socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowtapError {
    /// Shorthand for a configuration error.
    pub fn config(details: impl Into<String>) -> Self {
        FlowtapError::Config {
            details: details.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, FlowtapError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = FlowtapError::config("queue capacity must be greater than zero");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: queue capacity must be greater than zero"
        );
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err: FlowtapError = TransportError::Closed.into();
        assert_eq!(err.to_string(), TransportError::Closed.to_string());
    }
}
