//! Delivery worker.
//!
//! A single background task that dequeues events, serializes them and
//! publishes them through the transport it owns. Delivery is at-most-once:
//! an event whose publish fails is dropped, the connection is rebuilt, and
//! the loop moves on to the next event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::event::OutboundEvent;
use crate::metrics::ForwarderMetrics;
use crate::queue::EventReceiver;
use crate::transport::{Transport, TransportError};

/// Outcome of delivering one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Published,
    /// Publish failed; connection was rebuilt (or a rebuild was attempted)
    Rebuilt,
    /// Event could not be delivered; connection untouched
    Dropped,
}

pub struct DeliveryWorker<T: Transport> {
    transport: T,
    queue: EventReceiver,
    metrics: Arc<ForwarderMetrics>,
    shutdown: CancellationToken,
}

impl<T: Transport> DeliveryWorker<T> {
    pub fn new(
        transport: T,
        queue: EventReceiver,
        metrics: Arc<ForwarderMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            queue,
            metrics,
            shutdown,
        }
    }

    /// Run until shutdown is requested and the queue is drained, or until
    /// every producer is gone.
    pub async fn run(mut self) {
        info!(transport = %self.transport.describe(), "Delivery worker started");

        let mut closing = false;
        loop {
            tokio::select! {
                next = self.queue.recv() => match next {
                    Some(event) => {
                        self.deliver(event).await;
                    }
                    None => break,
                },
                _ = self.shutdown.cancelled(), if !closing => {
                    debug!("Shutdown requested, draining queue");
                    self.queue.close();
                    closing = true;
                }
            }
        }

        self.transport.close().await;
        info!("Delivery worker stopped");
    }

    /// Serialize and publish a single event. Never fails.
    pub async fn deliver(&mut self, event: OutboundEvent) -> Delivery {
        let label = event.label();
        let flow_id = event.flow_id().map(|id| id.to_string()).unwrap_or_default();

        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    event = label,
                    flow_id = %flow_id,
                    error = %e,
                    "Failed to serialize event"
                );
                self.metrics.events_dropped.inc();
                return Delivery::Dropped;
            }
        };

        let attempt = AssertUnwindSafe(self.transport.publish(&payload))
            .catch_unwind()
            .await;

        match attempt {
            Ok(Ok(())) => {
                self.metrics.events_published.inc();
                debug!(
                    event = label,
                    flow_id = %flow_id,
                    bytes = payload.len(),
                    "Event published"
                );
                Delivery::Published
            }
            Ok(Err(e)) if e.is_send_failure() => {
                error!(
                    event = label,
                    flow_id = %flow_id,
                    error = %e,
                    "Publish failed, rebuilding connection"
                );
                self.metrics.publish_failures.inc();
                self.rebuild().await;
                Delivery::Rebuilt
            }
            Ok(Err(e)) => {
                error!(
                    event = label,
                    flow_id = %flow_id,
                    error = %e,
                    "Unexpected transport error"
                );
                self.metrics.publish_failures.inc();
                Delivery::Dropped
            }
            Err(_) => {
                error!(
                    event = label,
                    flow_id = %flow_id,
                    "Transport panicked during publish, rebuilding connection"
                );
                self.metrics.publish_failures.inc();
                self.rebuild().await;
                Delivery::Rebuilt
            }
        }
    }

    async fn rebuild(&mut self) {
        self.metrics.transport_rebuilds.inc();
        let attempt = AssertUnwindSafe(self.transport.rebuild())
            .catch_unwind()
            .await;
        let result: Result<(), TransportError> = attempt.unwrap_or(Err(TransportError::Closed));

        if let Err(e) = result {
            error!(transport = %self.transport.describe(), error = %e, "Connection rebuild failed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
