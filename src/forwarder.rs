//! Capture-callback surface.
//!
//! The proxy calls [`Forwarder::on_request_captured`] and
//! [`Forwarder::on_response_captured`] from its own threads. Both build
//! events, touch the correlation cache and enqueue; neither waits on the
//! network, and neither ever returns an error or panics back into the
//! proxy. The only point where they can wait is a full queue under the
//! blocking policy.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ForwarderConfig;
use crate::correlation::CorrelationCache;
use crate::error::Result;
use crate::event::{EventBuilder, EventSchema, OutboundEvent};
use crate::flow::Flow;
use crate::metrics::ForwarderMetrics;
use crate::queue::{self, EnqueueError, EventQueue};
use crate::transport::{Transport, TransportKind, ZmqPublisher};
use crate::worker::DeliveryWorker;

/// Producer handle given to the proxy.
pub struct Forwarder {
    builder: EventBuilder,
    schema: EventSchema,
    queue: EventQueue,
    cache: Arc<CorrelationCache>,
    metrics: Arc<ForwarderMetrics>,
}

/// Owns the background tasks started alongside a [`Forwarder`].
pub struct ForwarderHandle {
    worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Forwarder {
    /// Open the configured transport and start the pipeline.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: &ForwarderConfig) -> Result<(Self, ForwarderHandle)> {
        config.validate()?;
        let transport = open_transport(config).await?;
        Self::with_transport(config, transport)
    }

    /// Start the pipeline over an already opened transport.
    ///
    /// Spawns the delivery worker and the cache sweeper on the current
    /// tokio runtime.
    pub fn with_transport<T>(
        config: &ForwarderConfig,
        transport: T,
    ) -> Result<(Self, ForwarderHandle)>
    where
        T: Transport + 'static,
    {
        config.validate()?;
        let metrics = Arc::new(ForwarderMetrics::new()?);
        let cache = Arc::new(CorrelationCache::new(config.cache_ttl, config.cache_max_entries));
        let (queue, receiver) = queue::bounded(config.queue_capacity, config.queue_full_policy);
        let shutdown = CancellationToken::new();

        let worker = DeliveryWorker::new(
            transport,
            receiver,
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        let worker = tokio::spawn(worker.run());
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&cache),
            Arc::clone(&metrics),
            config.cache_sweep_interval,
            shutdown.clone(),
        ));

        info!(
            capacity = config.queue_capacity,
            policy = ?config.queue_full_policy,
            schema = ?config.schema,
            "Forwarder started"
        );

        let forwarder = Self {
            builder: EventBuilder,
            schema: config.schema,
            queue,
            cache,
            metrics,
        };
        let handle = ForwarderHandle {
            worker,
            sweeper,
            shutdown,
        };
        Ok((forwarder, handle))
    }

    /// Request-complete hook for synchronous hosts.
    pub fn on_request_captured<F: Flow + ?Sized>(&self, flow: &F) {
        for event in self.request_events(flow) {
            let label = event.label();
            let result = self.queue.enqueue_blocking(event);
            self.record_enqueue(label, result);
        }
    }

    /// Response-complete hook for synchronous hosts.
    pub fn on_response_captured<F: Flow + ?Sized>(&self, flow: &F) {
        for event in self.response_events(flow) {
            let label = event.label();
            let result = self.queue.enqueue_blocking(event);
            self.record_enqueue(label, result);
        }
    }

    /// Request-complete hook for async hosts.
    pub async fn capture_request<F: Flow + ?Sized>(&self, flow: &F) {
        for event in self.request_events(flow) {
            let label = event.label();
            let result = self.queue.enqueue(event).await;
            self.record_enqueue(label, result);
        }
    }

    /// Response-complete hook for async hosts.
    pub async fn capture_response<F: Flow + ?Sized>(&self, flow: &F) {
        for event in self.response_events(flow) {
            let label = event.label();
            let result = self.queue.enqueue(event).await;
            self.record_enqueue(label, result);
        }
    }

    /// Counters of this forwarder's pipeline.
    pub fn metrics(&self) -> &ForwarderMetrics {
        &self.metrics
    }

    /// Requests still waiting for their response.
    pub fn pending_requests(&self) -> usize {
        self.cache.len()
    }

    fn request_events<F: Flow + ?Sized>(&self, flow: &F) -> Vec<OutboundEvent> {
        let now = Utc::now();
        match self.schema {
            EventSchema::Legacy => vec![OutboundEvent::LegacyRequest(
                self.builder.legacy_request(flow.request()),
            )],
            EventSchema::Enriched => {
                let meta = self.builder.connection_metadata(flow, now);
                let captured = self.builder.capture_request(flow.request(), now);
                let detail = self.builder.request_detail(&meta, &captured);
                let summary = self.builder.request_summary(meta, &captured);

                let evicted = self.cache.insert(flow.id().clone(), captured);
                if evicted > 0 {
                    self.metrics.correlation_evictions.inc_by(evicted as u64);
                }
                self.metrics.correlation_entries.set(self.cache.len() as i64);

                vec![detail.into(), summary.into()]
            }
        }
    }

    fn response_events<F: Flow + ?Sized>(&self, flow: &F) -> Vec<OutboundEvent> {
        let Some(response) = flow.response() else {
            warn!(flow_id = %flow.id(), "Response hook fired without a response");
            return Vec::new();
        };

        match self.schema {
            EventSchema::Legacy => vec![OutboundEvent::LegacyResponse(
                self.builder.legacy_response(flow.request(), response),
            )],
            EventSchema::Enriched => {
                let request = self.cache.take(flow.id());
                self.metrics.correlation_entries.set(self.cache.len() as i64);
                if request.is_none() {
                    self.metrics.correlation_misses.inc();
                    info!(
                        flow_id = %flow.id(),
                        "No cached request for response, emitting response fields only"
                    );
                }

                let meta = self.builder.connection_metadata(flow, Utc::now());
                let detail = self.builder.response_detail(&meta, response);
                let summary = self.builder.response_summary(meta, response, request.as_ref());

                vec![summary.into(), detail.into()]
            }
        }
    }

    fn record_enqueue(&self, label: &'static str, result: std::result::Result<(), EnqueueError>) {
        match result {
            Ok(()) => self.metrics.events_enqueued.inc(),
            Err(EnqueueError::CannotBlock) => {
                self.metrics.events_dropped.inc();
                warn!(
                    event = label,
                    "Event queue full on a current-thread runtime, dropping instead of blocking"
                );
            }
            Err(e) => {
                self.metrics.events_dropped.inc();
                debug!(event = label, reason = %e, "Event dropped at enqueue");
            }
        }
    }
}

impl ForwarderHandle {
    /// Stop accepting events, publish what is already queued, close the
    /// transport and stop the sweeper.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Delivery worker ended abnormally");
        }
        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "Cache sweeper ended abnormally");
        }
        info!("Forwarder stopped");
    }

    /// Whether the delivery worker is still running.
    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }
}

async fn open_transport(config: &ForwarderConfig) -> Result<Box<dyn Transport>> {
    match config.transport {
        TransportKind::Zmq => Ok(Box::new(ZmqPublisher::bind(&config.endpoint).await?)),
        #[cfg(feature = "redis")]
        TransportKind::Redis => {
            let publisher =
                crate::transport::RedisListPublisher::connect(&config.redis_url, &config.redis_list)
                    .await?;
            Ok(Box::new(publisher))
        }
        #[cfg(not(feature = "redis"))]
        TransportKind::Redis => Err(crate::transport::TransportError::Unavailable {
            kind: TransportKind::Redis,
        }
        .into()),
    }
}

async fn sweep_loop(
    cache: Arc<CorrelationCache>,
    metrics: Arc<ForwarderMetrics>,
    every: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = cache.sweep();
                if evicted > 0 {
                    metrics.correlation_evictions.inc_by(evicted as u64);
                    info!(
                        evicted,
                        ttl = ?cache.ttl(),
                        "Evicted requests that never saw a response"
                    );
                }
                metrics.correlation_entries.set(cache.len() as i64);
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
