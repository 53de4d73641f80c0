//! In-memory publisher for tests/dev.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::r#trait::{PublishError, Publisher};

/// One recorded `send` call that the transport acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Debug, Default)]
struct Inner {
    deliveries: Mutex<Vec<Delivery>>,
    rejected_payloads: Mutex<HashSet<Vec<u8>>>,
    latency: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

/// Recording publisher.
///
/// - Records every acknowledged delivery in order
/// - Can be switched unavailable, reject specific payloads, or add latency
/// - Clones share state (keep one handle for assertions)
#[derive(Debug, Clone, Default)]
pub struct InMemoryPublisher {
    inner: Arc<Inner>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate broker connectivity loss (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Permanently reject sends carrying exactly this payload.
    pub fn reject_payload(&self, payload: impl AsRef<[u8]>) {
        if let Ok(mut rejected) = self.inner.rejected_payloads.lock() {
            rejected.insert(payload.as_ref().to_vec());
        }
    }

    /// Delay every send by `latency` (`None` to disable).
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut l) = self.inner.latency.lock() {
            *l = latency;
        }
    }

    /// All acknowledged deliveries, in send order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.inner
            .deliveries
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Acknowledged payloads as strings, in send order.
    pub fn sent_payloads(&self) -> Vec<String> {
        self.deliveries()
            .iter()
            .map(|d| String::from_utf8_lossy(&d.payload).into_owned())
            .collect()
    }

    /// How many times `payload` was acknowledged.
    pub fn send_count(&self, payload: impl AsRef<[u8]>) -> usize {
        let payload = payload.as_ref();
        self.deliveries()
            .iter()
            .filter(|d| d.payload == payload)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn send(&self, channel: &str, payload: &[u8]) -> Result<(), PublishError> {
        let latency = self.inner.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.is_closed() {
            return Err(PublishError::Closed);
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable(
                "in-memory transport switched off".to_string(),
            ));
        }

        let rejected = self
            .inner
            .rejected_payloads
            .lock()
            .map(|r| r.contains(payload))
            .unwrap_or(false);
        if rejected {
            return Err(PublishError::Rejected(format!(
                "payload of {} bytes refused on '{channel}'",
                payload.len()
            )));
        }

        let mut deliveries = self
            .inner
            .deliveries
            .lock()
            .map_err(|_| PublishError::Unavailable("lock poisoned".to_string()))?;
        deliveries.push(Delivery {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_deliveries_in_order() {
        let publisher = InMemoryPublisher::new();

        publisher.send("outbox", b"first").await.unwrap();
        publisher.send("audit", b"second").await.unwrap();

        let deliveries = publisher.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].channel, "outbox");
        assert_eq!(deliveries[0].payload_str(), Some("first"));
        assert_eq!(deliveries[1].channel, "audit");
        assert_eq!(publisher.sent_payloads(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn unavailable_transport_fails_and_records_nothing() {
        let publisher = InMemoryPublisher::new();
        publisher.set_available(false);

        let err = publisher.send("outbox", b"x").await.unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
        assert!(publisher.deliveries().is_empty());

        publisher.set_available(true);
        publisher.send("outbox", b"x").await.unwrap();
        assert_eq!(publisher.send_count("x"), 1);
    }

    #[tokio::test]
    async fn rejects_configured_payloads_only() {
        let publisher = InMemoryPublisher::new();
        publisher.reject_payload("poison");

        assert!(matches!(
            publisher.send("outbox", b"poison").await,
            Err(PublishError::Rejected(_))
        ));
        publisher.send("outbox", b"fine").await.unwrap();
        assert_eq!(publisher.sent_payloads(), vec!["fine"]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_sends() {
        let publisher = InMemoryPublisher::new();

        publisher.close().await;
        publisher.close().await;

        assert!(publisher.is_closed());
        assert_eq!(publisher.close_calls(), 2);
        assert!(matches!(
            publisher.send("outbox", b"late").await,
            Err(PublishError::Closed)
        ));
    }

    #[tokio::test]
    async fn works_through_a_shared_arc() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let shared: Arc<dyn Publisher> = publisher.clone();

        shared.send("outbox", b"via-dyn").await.unwrap();
        assert_eq!(publisher.send_count("via-dyn"), 1);
    }
}
