use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info};

use super::{Transport, TransportError};

/// Pushes each event onto the tail of a named Redis list.
///
/// Host, port and credentials come from the connection URL, e.g.
/// `redis://:secret@192.168.1.10:6380/0`.
pub struct RedisListPublisher {
    client: redis::Client,
    list: String,
    conn: Option<MultiplexedConnection>,
}

impl RedisListPublisher {
    pub async fn connect(url: &str, list: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(|e| TransportError::Connect {
            endpoint: redacted(url),
            details: e.to_string(),
        })?;
        let mut publisher = Self {
            client,
            list: list.to_string(),
            conn: None,
        };
        publisher.conn = Some(publisher.open().await?);
        info!(list = %publisher.list, "Redis list publisher connected");
        Ok(publisher)
    }

    async fn open(&self) -> Result<MultiplexedConnection, TransportError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connect {
                endpoint: self.describe(),
                details: e.to_string(),
            })
    }
}

#[async_trait]
impl Transport for RedisListPublisher {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::Closed)?;
        let len: usize = conn
            .rpush(&self.list, payload)
            .await
            .map_err(TransportError::send)?;
        debug!(list = %self.list, len, "Pushed event");
        Ok(())
    }

    async fn rebuild(&mut self) -> Result<(), TransportError> {
        self.close().await;
        self.conn = Some(self.open().await?);
        info!(list = %self.list, "Redis connection rebuilt");
        Ok(())
    }

    async fn close(&mut self) {
        self.conn = None;
    }

    fn describe(&self) -> String {
        let info = self.client.get_connection_info();
        format!("redis-list {}/{}", info.addr, self.list)
    }
}

/// Strip credentials from a URL before it reaches a log line.
fn redacted(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_hides_password() {
        assert_eq!(
            redacted("redis://:hunter2@10.0.0.5:6380/0"),
            "redis://:***@10.0.0.5:6380/0"
        );
        assert_eq!(redacted("redis://127.0.0.1:6379"), "redis://127.0.0.1:6379");
        assert_eq!(redacted("::"), "<invalid url>");
    }

    #[tokio::test]
    async fn test_invalid_url_is_connect_error() {
        let err = RedisListPublisher::connect("not a url", "mitm_channel")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
