//! Prometheus metrics for the forwarding pipeline.
//!
//! Each [`ForwarderMetrics`] owns its own registry so several forwarders
//! (and tests) can coexist in one process.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Counters exposed by a running forwarder.
#[derive(Clone)]
pub struct ForwarderMetrics {
    registry: Registry,
    /// Events accepted onto the queue
    pub events_enqueued: IntCounter,
    /// Events lost to a full or closed queue, or to a serialization error
    pub events_dropped: IntCounter,
    /// Events handed to the transport successfully
    pub events_published: IntCounter,
    /// Publish calls that failed
    pub publish_failures: IntCounter,
    /// Connection rebuilds performed by the worker
    pub transport_rebuilds: IntCounter,
    /// Correlation entries removed by the TTL sweep
    pub correlation_evictions: IntCounter,
    /// Responses captured with no cached request
    pub correlation_misses: IntCounter,
    /// Entries currently held by the correlation cache
    pub correlation_entries: IntGauge,
}

impl ForwarderMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_enqueued = counter(
            &registry,
            "flowtap_events_enqueued_total",
            "Events accepted onto the queue",
        )?;
        let events_dropped = counter(
            &registry,
            "flowtap_events_dropped_total",
            "Events dropped before publish",
        )?;
        let events_published = counter(
            &registry,
            "flowtap_events_published_total",
            "Events published to the transport",
        )?;
        let publish_failures = counter(
            &registry,
            "flowtap_publish_failures_total",
            "Failed publish calls",
        )?;
        let transport_rebuilds = counter(
            &registry,
            "flowtap_transport_rebuilds_total",
            "Transport connection rebuilds",
        )?;
        let correlation_evictions = counter(
            &registry,
            "flowtap_correlation_evictions_total",
            "Correlation entries evicted after their TTL",
        )?;
        let correlation_misses = counter(
            &registry,
            "flowtap_correlation_misses_total",
            "Responses without a cached request",
        )?;

        let correlation_entries = IntGauge::with_opts(Opts::new(
            "flowtap_correlation_entries",
            "Requests waiting for their response",
        ))?;
        registry.register(Box::new(correlation_entries.clone()))?;

        Ok(Self {
            registry,
            events_enqueued,
            events_dropped,
            events_published,
            publish_failures,
            transport_rebuilds,
            correlation_evictions,
            correlation_misses,
            correlation_entries,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the text exposition format.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

// ============================================================================
// Tests
// ============================================================================
