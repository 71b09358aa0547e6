//! flowtap - forwards intercepted HTTP(S) flows to downstream consumers.
//!
//! A capture host hands every request and response it intercepts to a
//! [`Forwarder`]. The forwarder turns them into JSON events, correlates
//! responses with their requests, and publishes the events from a single
//! background worker over a pub/sub socket (or a redis list).
//!
//! # Pipeline
//!
//! - **Capture:** [`Forwarder::on_request_captured`] and
//!   [`Forwarder::on_response_captured`] build events and enqueue them.
//!   They never perform network I/O.
//! - **Queue:** a bounded FIFO ([`queue`]) with a configurable full policy.
//! - **Delivery:** [`worker::DeliveryWorker`] publishes at most once and
//!   rebuilds the connection after a failed send.
//!
//! Subscribers see, per flow, a request detail and a request summary at
//! request time, then a `flow_info` summary and a response detail at
//! response time.

pub mod config;
pub mod consumer;
pub mod correlation;
pub mod error;
pub mod event;
pub mod flow;
pub mod forwarder;
pub mod logging_layer;
pub mod metrics;
pub mod queue;
pub mod transport;
pub mod worker;

pub use config::ForwarderConfig;
pub use error::{FlowtapError, Result};
pub use event::{EventSchema, OutboundEvent};
pub use flow::{CapturedFlow, Flow, FlowId, Headers, HttpRequest, HttpResponse, PeerAddress};
pub use forwarder::{Forwarder, ForwarderHandle};
pub use queue::QueueFullPolicy;
pub use transport::{Transport, TransportError, TransportKind};
