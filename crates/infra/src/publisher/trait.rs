use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Transport send failure.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Connectivity loss (broker unreachable, connection dropped).
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the message.
    #[error("transport rejected message: {0}")]
    Rejected(String),

    /// The per-call time budget elapsed.
    #[error("transport send timed out after {0:?}")]
    Timeout(Duration),

    /// `send` was called after `close`.
    #[error("publisher is closed")]
    Closed,
}

/// Sends raw payloads to a named channel.
///
/// Publishers are stateless with respect to the outbox: they never see
/// message identities, only `(channel, payload)` pairs. Delivery is confirmed
/// at the transport-acknowledgement level.
///
/// The relay calls `send` sequentially, but implementations must be
/// `Send + Sync` so a single publisher can be shared behind an `Arc`.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send(&self, channel: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// Release underlying connection resources. Idempotent.
    async fn close(&self);
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn send(&self, channel: &str, payload: &[u8]) -> Result<(), PublishError> {
        (**self).send(channel, payload).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
