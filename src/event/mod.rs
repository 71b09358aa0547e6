//! Outbound telemetry events.
//!
//! Every event serializes to a flat JSON object of string and integer
//! values. Consumers dispatch on the discriminator fields:
//!
//! - `type` = `request` / `flow_info`: enriched [`FlowSummary`]
//! - no `type`, `headers` + `body` present: [`RequestDetail`] or
//!   [`ResponseDetail`], told apart by `direction`
//! - `type` = `request` / `response` with a `content` field: legacy shape

pub mod builder;

use serde::Serialize;

use crate::flow::FlowId;

pub use builder::EventBuilder;

/// Which side of the exchange an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

/// Discriminator carried in the `type` field of a summary event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    /// Emitted at request capture
    Request,
    /// Emitted at response capture
    FlowInfo,
}

/// Which event shapes the forwarder emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum EventSchema {
    /// Detail events per side plus flow summaries
    #[default]
    Enriched,
    /// One flat event per phase, no correlation
    Legacy,
}

/// Connection-level facts derived once per capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionMetadata {
    /// UTC, millisecond precision, trailing `Z`
    pub timestamp: String,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    /// Transport layer, always `TCP`
    pub protocol: String,
    /// Upper-cased scheme
    pub top_protocol: String,
    pub http_version: String,
    pub flow_id: FlowId,
    /// Resolved virtual host
    pub host: String,
}

/// Request fields held by the correlation cache until the response arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub url: String,
    pub headers: String,
    pub body: String,
    pub length: usize,
    pub content_type: String,
    pub timestamp: String,
    pub top_protocol: String,
}

/// Full dump of the request side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestDetail {
    pub direction: Direction,
    pub flow_id: FlowId,
    pub timestamp: String,
    pub top_protocol: String,
    pub method: String,
    pub path: String,
    pub url: String,
    pub headers: String,
    pub body: String,
    /// Byte length of the body before encoding
    pub length: usize,
    pub content_type: String,
}

/// Full dump of the response side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseDetail {
    pub direction: Direction,
    pub flow_id: FlowId,
    pub timestamp: String,
    pub top_protocol: String,
    pub status: u16,
    pub reason: String,
    pub headers: String,
    pub body: String,
    pub length: usize,
    pub content_type: String,
}

/// Enriched one-line view of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSummary {
    #[serde(rename = "type")]
    pub kind: SummaryKind,
    pub direction: Direction,
    #[serde(flatten)]
    pub meta: ConnectionMetadata,
    pub method: String,
    pub path: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub content_type: String,
    pub info: String,
}

/// Flat request event of the legacy schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub scheme: String,
    pub host: String,
    pub method: String,
    pub path: String,
    pub content: String,
}

/// Flat response event of the legacy schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub scheme: String,
    pub host: String,
    pub status: u16,
    pub content: String,
}

/// Unit placed on the queue and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundEvent {
    RequestDetail(RequestDetail),
    ResponseDetail(ResponseDetail),
    FlowSummary(FlowSummary),
    LegacyRequest(LegacyRequest),
    LegacyResponse(LegacyResponse),
}

impl OutboundEvent {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            OutboundEvent::RequestDetail(_) => "request_detail",
            OutboundEvent::ResponseDetail(_) => "response_detail",
            OutboundEvent::FlowSummary(s) => match s.kind {
                SummaryKind::Request => "request",
                SummaryKind::FlowInfo => "flow_info",
            },
            OutboundEvent::LegacyRequest(_) => "legacy_request",
            OutboundEvent::LegacyResponse(_) => "legacy_response",
        }
    }

    /// Flow the event belongs to. Legacy events carry none.
    pub fn flow_id(&self) -> Option<&FlowId> {
        match self {
            OutboundEvent::RequestDetail(d) => Some(&d.flow_id),
            OutboundEvent::ResponseDetail(d) => Some(&d.flow_id),
            OutboundEvent::FlowSummary(s) => Some(&s.meta.flow_id),
            OutboundEvent::LegacyRequest(_) | OutboundEvent::LegacyResponse(_) => None,
        }
    }

    /// Serialize to the JSON wire payload.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl From<RequestDetail> for OutboundEvent {
    fn from(value: RequestDetail) -> Self {
        OutboundEvent::RequestDetail(value)
    }
}

impl From<ResponseDetail> for OutboundEvent {
    fn from(value: ResponseDetail) -> Self {
        OutboundEvent::ResponseDetail(value)
    }
}

impl From<FlowSummary> for OutboundEvent {
    fn from(value: FlowSummary) -> Self {
        OutboundEvent::FlowSummary(value)
    }
}

// ============================================================================
// Tests
// ============================================================================
