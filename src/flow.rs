//! Captured flow model.
//!
//! The intercepting proxy owns its own flow objects. Flowtap only needs a
//! small capability set from them, expressed by the [`Flow`] trait. Hosts
//! that do not have a flow type of their own can build a [`CapturedFlow`].

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{FlowtapError, Result};

/// Proxy-assigned identity of one request/response exchange.
///
/// Used as the correlation key between request and response capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    /// Wrap an identifier supplied by the proxy.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Ordered header list with case-insensitive lookup.
///
/// Preserves capture order and the original name casing, including
/// duplicate names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any earlier value with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Render as `Name: Value` lines joined with `\n`.
    pub fn to_block(&self) -> String {
        self.iter()
            .map(|(n, v)| format!("{n}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// Server address as reported by the proxy.
///
/// Proxies report either a resolved `(ip, port)` pair or a bare address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddress {
    /// Resolved IP and port
    Socket(SocketAddr),
    /// Bare IP without a port
    Ip(IpAddr),
}

/// Request half of a flow.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub scheme: String,
    /// Host parsed by the proxy from the request target
    pub host: String,
    pub port: u16,
    pub method: String,
    /// Path including query string
    pub path: String,
    pub http_version: String,
    pub headers: Headers,
    /// Body exactly as it crossed the wire
    pub raw_content: Bytes,
    /// Body after content-encoding was removed, when the proxy decoded it
    pub content: Option<Bytes>,
    pub timestamp_start: Option<DateTime<Utc>>,
}

impl HttpRequest {
    /// Build a request from a method and absolute URL.
    pub fn new(method: &str, url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|source| FlowtapError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        let port = parsed
            .port_or_known_default()
            .unwrap_or_else(|| default_port(parsed.scheme()));
        let path = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_string(),
        };

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port,
            method: method.to_ascii_uppercase(),
            path,
            http_version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            raw_content: Bytes::new(),
            content: None,
            timestamp_start: None,
        })
    }

    /// Append a header in capture order.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the raw body as it arrived on the wire.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.raw_content = body.into();
        self
    }

    /// Override the default `HTTP/1.1` version string.
    pub fn with_http_version(mut self, version: &str) -> Self {
        self.http_version = version.to_string();
        self
    }

    /// Full URL, omitting the port when it is the scheme default.
    pub fn url(&self) -> String {
        if self.port == default_port(&self.scheme) {
            format!("{}://{}{}", self.scheme, self.host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        }
    }

    /// Decoded body when available, raw body otherwise.
    pub fn body(&self) -> &Bytes {
        self.content.as_ref().unwrap_or(&self.raw_content)
    }

    /// True for `https` and `wss`.
    pub fn is_encrypted(&self) -> bool {
        is_encrypted_scheme(&self.scheme)
    }
}

/// Response half of a flow.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: String,
    pub http_version: String,
    pub headers: Headers,
    pub raw_content: Bytes,
    pub content: Option<Bytes>,
}

impl HttpResponse {
    /// Build an `HTTP/1.1` response with no headers and an empty body.
    pub fn new(status_code: u16, reason: &str) -> Self {
        Self {
            status_code,
            reason: reason.to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            raw_content: Bytes::new(),
            content: None,
        }
    }

    /// Append a header in capture order.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the raw body as it arrived on the wire.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.raw_content = body.into();
        self
    }

    /// Decoded body when available, raw body otherwise.
    pub fn body(&self) -> &Bytes {
        self.content.as_ref().unwrap_or(&self.raw_content)
    }
}

/// Minimal capability set flowtap needs from a proxy flow.
pub trait Flow {
    /// Process-unique identity of the exchange.
    fn id(&self) -> &FlowId;

    fn request(&self) -> &HttpRequest;

    /// `None` until the response phase.
    fn response(&self) -> Option<&HttpResponse>;

    /// Peer address of the proxy's client connection.
    fn client_addr(&self) -> Option<SocketAddr>;

    /// Resolved upstream address, if the proxy connected already.
    fn server_addr(&self) -> Option<PeerAddress>;
}

/// Owned flow value for hosts that do not carry their own flow type.
#[derive(Debug, Clone)]
pub struct CapturedFlow {
    pub id: FlowId,
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    pub client_addr: Option<SocketAddr>,
    pub server_addr: Option<PeerAddress>,
}

impl CapturedFlow {
    /// Flow in its request phase, with no response or peer addresses yet.
    pub fn new(id: FlowId, request: HttpRequest) -> Self {
        Self {
            id,
            request,
            response: None,
            client_addr: None,
            server_addr: None,
        }
    }

    /// Move the flow into its response phase.
    pub fn with_response(mut self, response: HttpResponse) -> Self {
        self.response = Some(response);
        self
    }

    /// Record the proxy's client connection address.
    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Record the resolved upstream address.
    pub fn with_server_addr(mut self, addr: PeerAddress) -> Self {
        self.server_addr = Some(addr);
        self
    }
}

impl Flow for CapturedFlow {
    fn id(&self) -> &FlowId {
        &self.id
    }

    fn request(&self) -> &HttpRequest {
        &self.request
    }

    fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    fn server_addr(&self) -> Option<PeerAddress> {
        self.server_addr
    }
}

pub(crate) fn is_encrypted_scheme(scheme: &str) -> bool {
    matches!(scheme.to_ascii_lowercase().as_str(), "https" | "wss")
}

/// 443 for encrypted schemes, 80 otherwise.
pub(crate) fn default_port(scheme: &str) -> u16 {
    if is_encrypted_scheme(scheme) { 443 } else { 80 }
}

// ============================================================================
// Tests
// ============================================================================
