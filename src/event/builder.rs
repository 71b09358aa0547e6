//! Derives structured events from a captured flow.
//!
//! The builder never mutates the flow. Timestamps are passed in so the
//! same flow always yields the same events.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};

use super::{
    CapturedRequest, ConnectionMetadata, Direction, FlowSummary, LegacyRequest, LegacyResponse,
    RequestDetail, ResponseDetail, SummaryKind,
};
use crate::flow::{Flow, HttpRequest, HttpResponse, PeerAddress, default_port};

/// Transport-layer label carried by every summary.
pub const TRANSPORT_PROTOCOL: &str = "TCP";

/// Suffix of a response `info` line when the body is empty.
pub const CONTENT_MISSING: &str = "(content missing)";

/// Stateless event builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventBuilder;

impl EventBuilder {
    /// Derive connection metadata for the flow's current phase.
    pub fn connection_metadata<F: Flow + ?Sized>(
        &self,
        flow: &F,
        now: DateTime<Utc>,
    ) -> ConnectionMetadata {
        let request = flow.request();
        let (src_ip, src_port) = flow
            .client_addr()
            .map(|addr| (addr.ip().to_string(), addr.port()))
            .unwrap_or_default();
        let (dst_ip, dst_port) = resolve_server_addr(flow.server_addr(), request);
        let http_version = flow
            .response()
            .map(|r| r.http_version.clone())
            .unwrap_or_else(|| request.http_version.clone());

        ConnectionMetadata {
            timestamp: format_timestamp(now),
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            protocol: TRANSPORT_PROTOCOL.to_string(),
            top_protocol: request.scheme.to_ascii_uppercase(),
            http_version,
            flow_id: flow.id().clone(),
            host: resolve_host(request),
        }
    }

    /// Snapshot the request side for the correlation cache.
    pub fn capture_request(&self, request: &HttpRequest, now: DateTime<Utc>) -> CapturedRequest {
        let body = request.body();
        CapturedRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            url: request.url(),
            headers: request.headers.to_block(),
            body: encode_body(body),
            length: body.len(),
            content_type: content_type(&request.headers),
            timestamp: format_timestamp(request.timestamp_start.unwrap_or(now)),
            top_protocol: request.scheme.to_ascii_uppercase(),
        }
    }

    /// Full dump of the request side, emitted first at request capture.
    pub fn request_detail(
        &self,
        meta: &ConnectionMetadata,
        captured: &CapturedRequest,
    ) -> RequestDetail {
        RequestDetail {
            direction: Direction::Request,
            flow_id: meta.flow_id.clone(),
            timestamp: captured.timestamp.clone(),
            top_protocol: captured.top_protocol.clone(),
            method: captured.method.clone(),
            path: captured.path.clone(),
            url: captured.url.clone(),
            headers: captured.headers.clone(),
            body: captured.body.clone(),
            length: captured.length,
            content_type: captured.content_type.clone(),
        }
    }

    /// Summary emitted at request capture, with `info` set to
    /// `METHOD path version`.
    pub fn request_summary(
        &self,
        meta: ConnectionMetadata,
        captured: &CapturedRequest,
    ) -> FlowSummary {
        let info = format!("{} {} {}", captured.method, captured.path, meta.http_version);
        FlowSummary {
            kind: SummaryKind::Request,
            direction: Direction::Request,
            meta,
            method: captured.method.clone(),
            path: captured.path.clone(),
            url: captured.url.clone(),
            status: None,
            content_type: captured.content_type.clone(),
            info,
        }
    }

    /// Summary emitted at response capture.
    ///
    /// `request` is the correlated request entry, or `None` when the cache
    /// had nothing for this flow; request fields are then left blank.
    pub fn response_summary(
        &self,
        meta: ConnectionMetadata,
        response: &HttpResponse,
        request: Option<&CapturedRequest>,
    ) -> FlowSummary {
        let content_type = content_type(&response.headers);
        let info = response_info(&meta.http_version, response, &content_type);
        let (method, path, url) = request
            .map(|r| (r.method.clone(), r.path.clone(), r.url.clone()))
            .unwrap_or_default();

        FlowSummary {
            kind: SummaryKind::FlowInfo,
            direction: Direction::Response,
            meta,
            method,
            path,
            url,
            status: Some(response.status_code),
            content_type,
            info,
        }
    }

    /// Full dump of the response side. `length` counts the raw body bytes.
    pub fn response_detail(
        &self,
        meta: &ConnectionMetadata,
        response: &HttpResponse,
    ) -> ResponseDetail {
        let body = response.body();
        ResponseDetail {
            direction: Direction::Response,
            flow_id: meta.flow_id.clone(),
            timestamp: meta.timestamp.clone(),
            top_protocol: meta.top_protocol.clone(),
            status: response.status_code,
            reason: response.reason.clone(),
            headers: response.headers.to_block(),
            body: encode_body(body),
            length: body.len(),
            content_type: content_type(&response.headers),
        }
    }

    /// Flat request event of the legacy schema.
    pub fn legacy_request(&self, request: &HttpRequest) -> LegacyRequest {
        LegacyRequest {
            kind: "request",
            scheme: request.scheme.clone(),
            host: request.host.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            content: encode_body(request.body()),
        }
    }

    /// Flat response event of the legacy schema.
    pub fn legacy_response(
        &self,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> LegacyResponse {
        LegacyResponse {
            kind: "response",
            scheme: request.scheme.clone(),
            host: request.host.clone(),
            status: response.status_code,
            content: encode_body(response.body()),
        }
    }
}

/// Resolve the virtual host.
///
/// Later sources overwrite earlier ones: the proxy's parsed host, then the
/// `Host` header, then the `:authority` pseudo-header.
pub fn resolve_host(request: &HttpRequest) -> String {
    let mut host = request.host.clone();
    if let Some(h) = request.headers.get("host") {
        host = h.to_string();
    }
    if let Some(authority) = request.headers.get(":authority") {
        host = authority.to_string();
    }
    host
}

/// Resolve the upstream `(ip, port)`.
///
/// A bare IP keeps the request's declared port. Without any resolved
/// address the declared host is used with the scheme's default port.
pub fn resolve_server_addr(addr: Option<PeerAddress>, request: &HttpRequest) -> (String, u16) {
    match addr {
        Some(PeerAddress::Socket(sock)) => (sock.ip().to_string(), sock.port()),
        Some(PeerAddress::Ip(ip)) => (ip.to_string(), request.port),
        None => (request.host.clone(), default_port(&request.scheme)),
    }
}

/// UTF-8 text when valid, base64 otherwise.
pub fn encode_body(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => STANDARD.encode(body),
    }
}

/// ISO-8601, UTC, milliseconds, trailing `Z`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn content_type(headers: &crate::flow::Headers) -> String {
    headers.get("content-type").unwrap_or_default().to_string()
}

fn response_info(http_version: &str, response: &HttpResponse, content_type: &str) -> String {
    let status_line = [http_version, &response.status_code.to_string(), response.reason.as_str()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if response.body().is_empty() {
        format!("{status_line}  {CONTENT_MISSING}")
    } else if content_type.is_empty() {
        format!("{status_line}  (unknown content type)")
    } else {
        format!("{status_line}  ({content_type})")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{CapturedFlow, FlowId};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap()
            + chrono::Duration::milliseconds(535)
    }

    fn request_with_headers(headers: &[(&str, &str)]) -> HttpRequest {
        let mut req = HttpRequest::new("GET", "http://a/").unwrap();
        for (n, v) in headers {
            req = req.with_header(n, v);
        }
        req
    }

    #[test]
    fn test_host_precedence_authority_wins() {
        let req = request_with_headers(&[("Host", "b"), (":authority", "c")]);
        assert_eq!(resolve_host(&req), "c");
    }

    #[test]
    fn test_host_precedence_host_header_over_parsed() {
        let req = request_with_headers(&[("Host", "b")]);
        assert_eq!(resolve_host(&req), "b");
    }

    #[test]
    fn test_host_precedence_parsed_only() {
        let req = request_with_headers(&[]);
        assert_eq!(resolve_host(&req), "a");
    }

    #[test]
    fn test_host_precedence_authority_without_host_header() {
        let req = request_with_headers(&[(":authority", "c")]);
        assert_eq!(resolve_host(&req), "c");
    }

    #[test]
    fn test_server_addr_resolved_socket() {
        let req = HttpRequest::new("GET", "https://example.com/").unwrap();
        let socket = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 8443);
        let addr = PeerAddress::Socket(socket);
        assert_eq!(resolve_server_addr(Some(addr), &req), ("1.2.3.4".to_string(), 8443));
    }

    #[test]
    fn test_server_addr_bare_ip_keeps_declared_port() {
        let req = HttpRequest::new("GET", "http://example.com:8080/").unwrap();
        let addr = PeerAddress::Ip(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(resolve_server_addr(Some(addr), &req), ("1.2.3.4".to_string(), 8080));
    }

    #[test]
    fn test_server_addr_fallback_default_ports() {
        let https = HttpRequest::new("GET", "https://example.com:8443/").unwrap();
        assert_eq!(resolve_server_addr(None, &https), ("example.com".to_string(), 443));

        let http = HttpRequest::new("GET", "http://example.com:8080/").unwrap();
        assert_eq!(resolve_server_addr(None, &http), ("example.com".to_string(), 80));
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(fixed_now()), "2025-03-14T15:09:26.535Z");
    }

    #[test]
    fn test_encode_body_text_and_binary() {
        assert_eq!(encode_body(b"hello"), "hello");
        assert_eq!(encode_body(&[0xff, 0xfe, 0x00]), "//4A");
        assert_eq!(encode_body(b""), "");
    }

    #[test]
    fn test_connection_metadata() {
        let flow = CapturedFlow::new(
            FlowId::new("F1"),
            HttpRequest::new("GET", "https://example.com/a")
                .unwrap()
                .with_http_version("HTTP/2.0")
                .with_header(":authority", "api.example.com"),
        )
        .with_client_addr("10.0.0.2:51000".parse().unwrap());

        let meta = EventBuilder.connection_metadata(&flow, fixed_now());
        assert_eq!(meta.src_ip, "10.0.0.2");
        assert_eq!(meta.src_port, 51000);
        assert_eq!(meta.dst_ip, "example.com");
        assert_eq!(meta.dst_port, 443);
        assert_eq!(meta.protocol, "TCP");
        assert_eq!(meta.top_protocol, "HTTPS");
        assert_eq!(meta.http_version, "HTTP/2.0");
        assert_eq!(meta.host, "api.example.com");
        assert_eq!(meta.timestamp, "2025-03-14T15:09:26.535Z");
    }

    #[test]
    fn test_missing_client_addr_is_blank() {
        let request = HttpRequest::new("GET", "http://a/").unwrap();
        let flow = CapturedFlow::new(FlowId::new("F1"), request);
        let meta = EventBuilder.connection_metadata(&flow, fixed_now());
        assert_eq!(meta.src_ip, "");
        assert_eq!(meta.src_port, 0);
    }

    #[test]
    fn test_request_detail_and_summary() {
        let req = HttpRequest::new("POST", "http://example.com/a")
            .unwrap()
            .with_header("Content-Type", "application/json")
            .with_body(&b"{\"k\":1}"[..]);
        let flow = CapturedFlow::new(FlowId::new("F1"), req);

        let meta = EventBuilder.connection_metadata(&flow, fixed_now());
        let captured = EventBuilder.capture_request(flow.request(), fixed_now());
        let detail = EventBuilder.request_detail(&meta, &captured);
        let summary = EventBuilder.request_summary(meta, &captured);

        assert_eq!(detail.direction, Direction::Request);
        assert_eq!(detail.path, "/a");
        assert_eq!(detail.headers, "Content-Type: application/json");
        assert_eq!(detail.body, "{\"k\":1}");
        assert_eq!(detail.length, 7);
        assert_eq!(summary.kind, SummaryKind::Request);
        assert_eq!(summary.info, "POST /a HTTP/1.1");
        assert_eq!(summary.content_type, "application/json");
    }

    #[test]
    fn test_response_summary_without_request_is_blank() {
        let request = HttpRequest::new("GET", "http://a/").unwrap();
        let flow = CapturedFlow::new(FlowId::new("F9"), request)
            .with_response(HttpResponse::new(204, "No Content"));
        let meta = EventBuilder.connection_metadata(&flow, fixed_now());

        let summary = EventBuilder.response_summary(meta, flow.response().unwrap(), None);
        assert_eq!(summary.method, "");
        assert_eq!(summary.path, "");
        assert_eq!(summary.url, "");
        assert_eq!(summary.status, Some(204));
    }

    #[test]
    fn test_response_info_lines() {
        let empty = HttpResponse::new(200, "OK");
        assert_eq!(response_info("HTTP/1.1", &empty, ""), "HTTP/1.1 200 OK  (content missing)");

        let html = HttpResponse::new(200, "OK").with_body(&b"<p>"[..]);
        assert_eq!(
            response_info("HTTP/1.1", &html, "text/html"),
            "HTTP/1.1 200 OK  (text/html)"
        );

        let h2 = HttpResponse::new(200, "").with_body(&b"x"[..]);
        assert_eq!(response_info("HTTP/2.0", &h2, ""), "HTTP/2.0 200  (unknown content type)");
    }

    #[test]
    fn test_response_detail_binary_body() {
        let request = HttpRequest::new("GET", "http://a/").unwrap();
        let flow = CapturedFlow::new(FlowId::new("F1"), request)
            .with_response(
                HttpResponse::new(200, "OK")
                    .with_header("Content-Type", "image/png")
                    .with_body(&b"\x89PNG"[..]),
            );
        let meta = EventBuilder.connection_metadata(&flow, fixed_now());
        let detail = EventBuilder.response_detail(&meta, flow.response().unwrap());

        assert_eq!(detail.length, 4);
        assert_eq!(STANDARD.decode(&detail.body).unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);
        assert_eq!(detail.content_type, "image/png");
    }

    #[test]
    fn test_legacy_events() {
        let req = HttpRequest::new("GET", "http://example.com/x").unwrap();
        let resp = HttpResponse::new(301, "Moved").with_body(&b"gone"[..]);

        let lr = EventBuilder.legacy_request(&req);
        assert_eq!(lr.kind, "request");
        assert_eq!(lr.path, "/x");

        let lp = EventBuilder.legacy_response(&req, &resp);
        assert_eq!(lp.kind, "response");
        assert_eq!(lp.status, 301);
        assert_eq!(lp.content, "gone");
    }

    proptest! {
        #[test]
        fn prop_body_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let encoded = encode_body(&bytes);
            match std::str::from_utf8(&bytes) {
                Ok(text) => prop_assert_eq!(encoded, text),
                Err(_) => prop_assert_eq!(STANDARD.decode(&encoded).unwrap(), bytes.clone()),
            }
        }

        #[test]
        fn prop_host_precedence(
            parsed in "[a-z]{1,12}",
            host in proptest::option::of("[a-z]{1,12}"),
            authority in proptest::option::of("[a-z]{1,12}"),
        ) {
            let mut req = HttpRequest::new("GET", &format!("http://{parsed}/")).unwrap();
            if let Some(h) = &host {
                req = req.with_header("Host", h);
            }
            if let Some(a) = &authority {
                req = req.with_header(":authority", a);
            }

            let expected = authority.or(host).unwrap_or(parsed);
            prop_assert_eq!(resolve_host(&req), expected);
        }
    }
}
