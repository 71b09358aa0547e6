use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

use super::{Transport, TransportError};

/// Default publish endpoint.
pub const DEFAULT_ENDPOINT: &str = "tcp://*:5555";

const BIND_ATTEMPTS: usize = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Publish-pattern socket bound to a fixed TCP endpoint.
///
/// Subscribers impose no backpressure; a message with no subscriber
/// attached is simply discarded by the socket.
pub struct ZmqPublisher {
    /// Endpoint actually bound (port resolved when `0` was requested)
    endpoint: String,
    socket: Option<PubSocket>,
}

impl ZmqPublisher {
    /// Bind a new publisher. `*` as host means all interfaces.
    pub async fn bind(endpoint: &str) -> Result<Self, TransportError> {
        let requested = normalize_endpoint(endpoint);
        let (socket, bound) = open(&requested).await?;
        info!(endpoint = %bound, "Publish socket bound");

        Ok(Self {
            endpoint: bound,
            socket: Some(socket),
        })
    }

    /// Endpoint subscribers should connect to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for ZmqPublisher {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::Closed)?;
        socket
            .send(ZmqMessage::from(payload.to_vec()))
            .await
            .map_err(TransportError::send)
    }

    async fn rebuild(&mut self) -> Result<(), TransportError> {
        self.close().await;

        let mut last_err = TransportError::Closed;
        for attempt in 1..=BIND_ATTEMPTS {
            match open(&self.endpoint).await {
                Ok((socket, _)) => {
                    self.socket = Some(socket);
                    info!(endpoint = %self.endpoint, attempt, "Publish socket rebuilt");
                    return Ok(());
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, attempt, error = %e, "Rebind failed");
                    last_err = e;
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
            }
        }
        Err(last_err)
    }

    async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            // Dropping the socket discards queued outbound messages.
            for err in socket.close().await {
                debug!(
                    endpoint = %self.endpoint,
                    error = %err,
                    "Error while closing publish socket"
                );
            }
        }
    }

    fn describe(&self) -> String {
        format!("zmq-pub {}", self.endpoint)
    }
}

async fn open(endpoint: &str) -> Result<(PubSocket, String), TransportError> {
    let mut socket = PubSocket::new();
    let bound = socket
        .bind(endpoint)
        .await
        .map_err(|e| TransportError::Bind {
            endpoint: endpoint.to_string(),
            details: e.to_string(),
        })?;
    Ok((socket, bound.to_string()))
}

/// Rewrite the `*` wildcard host to the IPv4 any-address.
pub fn normalize_endpoint(endpoint: &str) -> String {
    match endpoint.strip_prefix("tcp://*:") {
        Some(port) => format!("tcp://0.0.0.0:{port}"),
        None => endpoint.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
