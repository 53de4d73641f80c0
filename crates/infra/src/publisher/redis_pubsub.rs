//! Redis pub/sub-backed publisher (optional).
//!
//! Uses `PUBLISH <channel> <payload>` over a multiplexed async connection.
//! Redis acknowledges a publish once it has accepted the command; subscribers
//! that are offline miss the message, which is acceptable for the outbox
//! since the store, not the transport, is the source of truth.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::r#trait::{PublishError, Publisher};
use crate::config::{ConfigError, RedisConfig};

/// Redis pub/sub publisher for raw outbox payloads.
pub struct RedisPublisher {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    closed: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPublisher")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl RedisPublisher {
    /// Build a publisher from validated configuration.
    ///
    /// No connection is opened until the first `send`.
    pub fn new(config: &RedisConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = redis::Client::open(config.url.as_str()).map_err(|e| ConfigError::Invalid {
            field: "redis.url",
            reason: e.to_string(),
        })?;
        Ok(Self::from_client(client))
    }

    /// Reuse an already configured client.
    pub fn from_client(client: redis::Client) -> Self {
        Self {
            client,
            connection: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, PublishError> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        debug!("redis publisher connected");
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn forget_connection(&self) {
        self.connection.lock().await.take();
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    #[instrument(skip(self, payload), fields(payload_len = payload.len()), err)]
    async fn send(&self, channel: &str, payload: &[u8]) -> Result<(), PublishError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }

        let mut conn = self.connection().await?;
        let result: redis::RedisResult<i64> = conn.publish(channel, payload).await;

        match result {
            Ok(receivers) => {
                debug!(receivers, "payload published");
                Ok(())
            }
            Err(e) => {
                let err = map_redis_error(e);
                if matches!(err, PublishError::Unavailable(_)) {
                    // Next send dials a fresh connection.
                    self.forget_connection().await;
                }
                warn!(error = %err, "redis publish failed");
                Err(err)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.forget_connection().await;
    }
}

fn map_redis_error(err: redis::RedisError) -> PublishError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        PublishError::Unavailable(err.to_string())
    } else {
        PublishError::Rejected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        let config = RedisConfig {
            url: "not a url".to_string(),
        };
        assert!(RedisPublisher::new(&config).is_err());
    }

    #[test]
    fn rejects_missing_url() {
        let config = RedisConfig { url: String::new() };
        assert!(matches!(
            RedisPublisher::new(&config),
            Err(ConfigError::Missing("redis.url"))
        ));
    }

    #[tokio::test]
    async fn closed_publisher_refuses_sends_without_dialing() {
        let publisher = RedisPublisher::new(&RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
        })
        .unwrap();

        publisher.close().await;
        publisher.close().await;

        assert!(matches!(
            publisher.send("outbox", b"x").await,
            Err(PublishError::Closed)
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_is_unavailable() {
        let publisher = RedisPublisher::new(&RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
        })
        .unwrap();

        assert!(matches!(
            publisher.send("outbox", b"x").await,
            Err(PublishError::Unavailable(_))
        ));
    }
}
