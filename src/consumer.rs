//! Reference subscriber.
//!
//! Connects to the publish endpoint, subscribes to everything, dispatches
//! each message on its discriminator fields and appends a timestamped raw
//! copy to a local log file. This is the minimum any consumer of the wire
//! format has to handle.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Local};
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::error::{FlowtapError, Result};
use crate::transport::TransportError;

// ============================================================================
// Message Classification
// ============================================================================

/// Default endpoint the subscriber connects to.
pub const DEFAULT_CONNECT: &str = "tcp://127.0.0.1:5555";

/// Default append-only log file.
pub const DEFAULT_LOG_FILE: &str = "mitm_traffic.log";

/// What a received message turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Enriched summary emitted at request capture
    Request { method: String, url: String },
    /// Enriched summary emitted at response capture
    FlowInfo { flow_id: String, info: String },
    /// Header and body dump for one side
    Detail { direction: String, flow_id: String },
    /// Flat legacy request
    LegacyRequest { method: String, url: String },
    /// Flat legacy response
    LegacyResponse { status: i64, host: String },
    /// Valid JSON with no recognised discriminator
    Unknown,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request { method, url } | MessageKind::LegacyRequest { method, url } => {
                write!(f, "[request] {method} {url}")
            }
            MessageKind::LegacyResponse { status, host } => write!(f, "[response] {status} {host}"),
            MessageKind::FlowInfo { flow_id, info } => write!(f, "[flow {flow_id}] {info}"),
            MessageKind::Detail { direction, flow_id } => {
                write!(f, "[detail:{direction}] {flow_id}")
            }
            MessageKind::Unknown => f.write_str("[unknown]"),
        }
    }
}

/// Classify a decoded message.
pub fn classify(value: &Value) -> MessageKind {
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let is_legacy = value.get("content").is_some();

    match value.get("type").and_then(Value::as_str) {
        Some("request") if is_legacy => MessageKind::LegacyRequest {
            method: text("method"),
            url: format!("{}{}", text("host"), text("path")),
        },
        Some("request") => MessageKind::Request {
            method: text("method"),
            url: text("url"),
        },
        Some("response") => MessageKind::LegacyResponse {
            status: value.get("status").and_then(Value::as_i64).unwrap_or_default(),
            host: text("host"),
        },
        Some("flow_info") => MessageKind::FlowInfo {
            flow_id: text("flow_id"),
            info: text("info"),
        },
        Some(_) => MessageKind::Unknown,
        None if value.get("headers").is_some() && value.get("body").is_some() => {
            MessageKind::Detail {
                direction: text("direction"),
                flow_id: text("flow_id"),
            }
        }
        None => MessageKind::Unknown,
    }
}

// ============================================================================
// Counters and Traffic Log
// ============================================================================

/// Running totals kept by the subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub http: u64,
    pub https: u64,
    pub malformed: u64,
}

impl ConsumerStats {
    /// Count one message, split by scheme.
    pub fn record(&mut self, value: Option<&Value>) {
        self.received += 1;
        let Some(value) = value else {
            self.malformed += 1;
            return;
        };

        let scheme = value
            .get("top_protocol")
            .or_else(|| value.get("scheme"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if scheme.eq_ignore_ascii_case("https") {
            self.https += 1;
        } else if scheme.eq_ignore_ascii_case("http") {
            self.http += 1;
        }
    }
}

/// Append-only traffic log.
pub struct TrafficLog {
    file: File,
}

impl TrafficLog {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    /// Write one line for `raw` and flush it.
    pub async fn append(&mut self, at: DateTime<Local>, raw: &str) -> Result<()> {
        self.file.write_all(log_line(at, raw).as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }
}

/// `<local timestamp>: <raw message>\n`
pub fn log_line(at: DateTime<Local>, raw: &str) -> String {
    format!("{}: {}\n", at.format("%Y-%m-%d %H:%M:%S%.6f"), raw)
}

// ============================================================================
// Subscriber Loop
// ============================================================================

/// Subscribe until `shutdown` fires. Returns the final counters.
pub async fn run_subscriber(
    connect: &str,
    log_path: impl AsRef<Path>,
    shutdown: CancellationToken,
) -> Result<ConsumerStats> {
    let mut socket = SubSocket::new();
    let connect_err = |e: zeromq::ZmqError| TransportError::Connect {
        endpoint: connect.to_string(),
        details: e.to_string(),
    };
    socket.connect(connect).await.map_err(connect_err)?;
    socket.subscribe("").await.map_err(connect_err)?;
    let mut log = TrafficLog::open(log_path.as_ref()).await?;
    info!(endpoint = %connect, log = %log_path.as_ref().display(), "Waiting for traffic events");

    let mut stats = ConsumerStats::default();
    loop {
        let message = tokio::select! {
            received = socket.recv() => received,
            _ = shutdown.cancelled() => break,
        };

        let raw = match message {
            Ok(msg) => match String::try_from(msg) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "Dropping non-UTF-8 message");
                    stats.record(None);
                    continue;
                }
            },
            Err(e) => {
                return Err(FlowtapError::Transport(TransportError::send(e)));
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => {
                println!("{}", classify(&value));
                stats.record(Some(&value));
            }
            Err(e) => {
                warn!(error = %e, "Message is not valid JSON");
                stats.record(None);
            }
        }
        log.append(Local::now(), &raw).await?;
    }

    let _ = socket.close().await;
    info!(
        received = stats.received,
        http = stats.http,
        https = stats.https,
        malformed = stats.malformed,
        "Subscriber stopped"
    );
    Ok(stats)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, OutboundEvent};
    use crate::flow::{CapturedFlow, FlowId, HttpRequest};
    use crate::transport::{Transport, ZmqPublisher};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_classify_enriched_summaries() {
        let req = json!({
            "type": "request",
            "method": "GET",
            "url": "http://example.com/a",
            "top_protocol": "HTTP"
        });
        assert_eq!(
            classify(&req).to_string(),
            "[request] GET http://example.com/a"
        );

        let flow = json!({
            "type": "flow_info",
            "flow_id": "F1",
            "info": "HTTP/1.1 200 OK  (content missing)"
        });
        assert_eq!(
            classify(&flow),
            MessageKind::FlowInfo {
                flow_id: "F1".to_string(),
                info: "HTTP/1.1 200 OK  (content missing)".to_string()
            }
        );
    }

    #[test]
    fn test_classify_detail_by_headers_and_body() {
        let detail = json!({
            "direction": "response",
            "flow_id": "F1",
            "headers": "",
            "body": "",
            "length": 0
        });
        assert_eq!(classify(&detail).to_string(), "[detail:response] F1");

        let headers_only = json!({"direction": "response", "headers": ""});
        assert_eq!(classify(&headers_only), MessageKind::Unknown);
    }

    #[test]
    fn test_classify_legacy_shapes() {
        let req = json!({
            "type": "request",
            "scheme": "http",
            "host": "example.com",
            "method": "GET",
            "path": "/x",
            "content": ""
        });
        assert_eq!(classify(&req).to_string(), "[request] GET example.com/x");

        let resp = json!({
            "type": "response",
            "scheme": "https",
            "host": "example.com",
            "status": 503,
            "content": ""
        });
        assert_eq!(classify(&resp).to_string(), "[response] 503 example.com");
    }

    #[test]
    fn test_stats_split_by_scheme() {
        let mut stats = ConsumerStats::default();
        stats.record(Some(&json!({"top_protocol": "HTTPS"})));
        stats.record(Some(&json!({"scheme": "http"})));
        stats.record(Some(&json!({"direction": "request"})));
        stats.record(None);

        assert_eq!(
            stats,
            ConsumerStats {
                received: 4,
                http: 1,
                https: 1,
                malformed: 1
            }
        );
    }

    #[test]
    fn test_log_line_format() {
        let at = Local.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(log_line(at, "{}"), "2025-01-02 03:04:05.000000: {}\n");
    }

    #[tokio::test]
    async fn test_traffic_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.log");

        let mut log = TrafficLog::open(&path).await.unwrap();
        log.append(Local::now(), r#"{"a":1}"#).await.unwrap();
        drop(log);

        let mut log = TrafficLog::open(&path).await.unwrap();
        log.append(Local::now(), r#"{"b":2}"#).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(r#": {"a":1}"#));
        assert!(lines[1].ends_with(r#": {"b":2}"#));
    }

    #[tokio::test]
    async fn test_run_subscriber_logs_published_events() {
        let mut publisher = ZmqPublisher::bind("tcp://127.0.0.1:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("traffic.log");

        let builder = EventBuilder;
        let flow = CapturedFlow::new(
            FlowId::new("F1"),
            HttpRequest::new("GET", "http://example.com/a").unwrap(),
        );
        let now = Utc::now();
        let meta = builder.connection_metadata(&flow, now);
        let captured = builder.capture_request(&flow.request, now);
        let detail = OutboundEvent::from(builder.request_detail(&meta, &captured));
        let summary = OutboundEvent::from(builder.request_summary(meta, &captured));
        let detail = String::from_utf8(detail.to_json().unwrap()).unwrap();
        let summary = String::from_utf8(summary.to_json().unwrap()).unwrap();

        let shutdown = CancellationToken::new();
        let subscriber = tokio::spawn(run_subscriber_owned(
            publisher.endpoint().to_string(),
            log_path.clone(),
            shutdown.clone(),
        ));

        // A PUB socket discards messages until the subscriber has joined,
        // so publish the pair until both kinds show up in the log.
        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                publisher.publish(detail.as_bytes()).await.unwrap();
                publisher.publish(summary.as_bytes()).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;

                let contents = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                if contents.contains(detail.as_str()) && contents.contains(summary.as_str()) {
                    break;
                }
            }
        })
        .await;
        assert!(joined.is_ok(), "subscriber never logged both events");

        shutdown.cancel();
        let stats = subscriber.await.unwrap().unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(stats.received, lines.len() as u64);
        assert_eq!(stats.http, stats.received);
        assert_eq!(stats.https, 0);
        assert_eq!(stats.malformed, 0);
        for line in lines {
            assert!(
                line.ends_with(&format!(": {detail}")) || line.ends_with(&format!(": {summary}")),
                "unexpected log line: {line}"
            );
        }
    }

    async fn run_subscriber_owned(
        connect: String,
        log_path: std::path::PathBuf,
        shutdown: CancellationToken,
    ) -> Result<ConsumerStats> {
        run_subscriber(&connect, log_path, shutdown).await
    }
}
