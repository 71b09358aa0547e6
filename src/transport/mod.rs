//! Outbound transports.
//!
//! A transport owns exactly one outbound connection and knows how to
//! rebuild it. The delivery worker is its only user, so implementations
//! need no internal locking; `publish` and `rebuild` never overlap.

mod zmq_pub;

#[cfg(feature = "redis")]
mod redis_list;

use async_trait::async_trait;
use thiserror::Error;

pub use self::zmq_pub::{DEFAULT_ENDPOINT, ZmqPublisher, normalize_endpoint};

#[cfg(feature = "redis")]
pub use self::redis_list::RedisListPublisher;

/// Which delivery primitive to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TransportKind {
    /// Publish-pattern socket
    #[default]
    Zmq,
    /// Push onto the tail of a list in a Redis server
    Redis,
}

/// Transport failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint could not be bound
    #[error("Failed to bind {endpoint}: {details}")]
    Bind {
        /// Endpoint that was requested
        endpoint: String,
        /// Error details
        details: String,
    },

    /// Remote service could not be reached
    #[error("Failed to connect to {endpoint}: {details}")]
    Connect {
        /// Endpoint that was requested
        endpoint: String,
        /// Error details
        details: String,
    },

    /// Publish call failed on an open connection
    #[error("Send failed: {details}")]
    Send {
        /// Error details
        details: String,
    },

    /// No connection is currently open
    #[error("Transport connection is closed")]
    Closed,

    /// Transport not compiled into this build
    #[error("Transport {kind:?} is not available in this build")]
    Unavailable {
        /// Requested transport
        kind: TransportKind,
    },
}

impl TransportError {
    /// Whether the worker should rebuild the connection.
    pub fn is_send_failure(&self) -> bool {
        matches!(self, TransportError::Send { .. } | TransportError::Closed)
    }

    pub(crate) fn send(details: impl ToString) -> Self {
        TransportError::Send {
            details: details.to_string(),
        }
    }
}

/// One outbound connection plus the means to rebuild it.
#[async_trait]
pub trait Transport: Send {
    /// Publish one serialized event.
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Drop the current connection, discarding anything it still buffers,
    /// and open a fresh one to the same endpoint.
    async fn rebuild(&mut self) -> Result<(), TransportError>;

    /// Close the connection for good.
    async fn close(&mut self);

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        (**self).publish(payload).await
    }

    async fn rebuild(&mut self) -> Result<(), TransportError> {
        (**self).rebuild().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_failures_trigger_rebuild() {
        assert!(TransportError::send("connection reset").is_send_failure());
        assert!(TransportError::Closed.is_send_failure());
        assert!(
            !TransportError::Bind {
                endpoint: "tcp://0.0.0.0:5555".to_string(),
                details: "address in use".to_string(),
            }
            .is_send_failure()
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            TransportError::send("connection reset").to_string(),
            "Send failed: connection reset"
        );
        assert_eq!(
            TransportError::Unavailable {
                kind: TransportKind::Redis
            }
            .to_string(),
            "Transport Redis is not available in this build"
        );
    }
}
