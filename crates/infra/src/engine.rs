//! Outbox engine: enqueue and batch relay.
//!
//! Both operations drive exactly one unit of work each. `enqueue` persists a
//! pending message; `relay` fetches a FIFO batch of pending messages, sends
//! each payload and marks it processed, committing the whole batch at once.
//!
//! ## Delivery semantics
//!
//! `send` runs while the relay transaction is still open. If a later step of
//! the same batch fails, the rollback reverts messages that were already sent
//! back to pending and the next relay sends them again. Delivery is therefore
//! at least once: a message is never lost and never published before its
//! creating transaction committed, but it may be published more than once.
//! Consumers are expected to deduplicate.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use outbox_core::{Message, MessageId};

use crate::config::RelayConfig;
use crate::error::OutboxResult;
use crate::publisher::{PublishError, Publisher};
use crate::store::{OutboxStore, StoreError, UnitOfWork};

/// Outcome of one successful relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    /// Pending messages fetched for this batch.
    pub fetched: usize,
    /// Messages sent and marked processed (committed).
    pub published: usize,
}

impl RelayReport {
    pub fn is_idle(&self) -> bool {
        self.fetched == 0
    }
}

/// Transactional outbox engine over a store and a publisher.
#[derive(Debug)]
pub struct OutboxEngine<S, P> {
    store: S,
    publisher: P,
    config: RelayConfig,
}

impl<S, P> OutboxEngine<S, P>
where
    S: OutboxStore,
    P: Publisher,
{
    /// Build an engine; fails when `config` does not validate.
    pub fn new(store: S, publisher: P, config: RelayConfig) -> OutboxResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            publisher,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Persist `payload` as a new pending message in its own unit of work.
    ///
    /// On `Ok` the message is committed and will be picked up by a later relay.
    /// On `Err` nothing was written.
    #[instrument(name = "outbox.enqueue", skip_all, err)]
    pub async fn enqueue(&self, payload: impl Into<String>) -> OutboxResult<MessageId> {
        let message = Message::new(payload);
        let id = message.id();

        let mut unit = self.store_call(self.store.begin()).await?;
        let created = self.store_call(unit.create(&message)).await;
        if let Err(e) = created {
            self.abort(unit).await;
            return Err(e.into());
        }
        self.store_call(unit.commit()).await?;

        debug!(message_id = %id, "message enqueued");
        Ok(id)
    }

    /// Stage `payload` inside a unit of work owned by the caller.
    ///
    /// This is the outbox write proper: the message commits or rolls back
    /// together with whatever business writes share `unit`. The caller
    /// terminates the unit.
    #[instrument(name = "outbox.enqueue_in", skip_all, err)]
    pub async fn enqueue_in(
        &self,
        unit: &mut S::Unit,
        payload: impl Into<String>,
    ) -> OutboxResult<MessageId> {
        let message = Message::new(payload);
        self.store_call(unit.create(&message)).await?;
        debug!(message_id = %message.id(), "message staged");
        Ok(message.id())
    }

    /// Relay one batch of pending messages.
    ///
    /// Any failure aborts the batch: the unit is rolled back and the error is
    /// returned. No retry happens here; the scheduler calls again on its next
    /// tick.
    #[instrument(
        name = "outbox.relay",
        skip_all,
        fields(batch_size = self.config.batch_size, channel = %self.config.channel),
        err
    )]
    pub async fn relay(&self) -> OutboxResult<RelayReport> {
        let mut unit = self.store_call(self.store.begin()).await?;

        let fetched = self
            .store_call(unit.find_pending(self.config.batch_size))
            .await;
        let batch = match fetched {
            Ok(batch) => batch,
            Err(e) => {
                self.abort(unit).await;
                return Err(e.into());
            }
        };

        let mut report = RelayReport {
            fetched: batch.len(),
            published: 0,
        };

        for message in &batch {
            if let Err(e) = self.publish_call(message.payload().as_bytes()).await {
                warn!(
                    message_id = %message.id(),
                    sent_in_batch = report.published,
                    error = %e,
                    "send failed, rolling back batch"
                );
                self.abort(unit).await;
                return Err(e.into());
            }

            let marked = self.store_call(unit.mark_processed(message)).await;
            if let Err(e) = marked {
                // Payloads sent earlier in this batch revert to pending.
                warn!(
                    message_id = %message.id(),
                    sent_in_batch = report.published + 1,
                    error = %e,
                    "mark processed failed, rolling back batch"
                );
                self.abort(unit).await;
                return Err(e.into());
            }

            report.published += 1;
        }

        self.store_call(unit.commit()).await?;

        if !report.is_idle() {
            info!(
                fetched = report.fetched,
                published = report.published,
                "relay batch committed"
            );
        }
        Ok(report)
    }

    /// Release the publisher's connection resources.
    pub async fn close(&self) {
        self.publisher.close().await;
    }

    async fn store_call<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        bounded(self.config.store_timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.config.store_timeout)))
    }

    async fn publish_call(&self, payload: &[u8]) -> Result<(), PublishError> {
        let send = self.publisher.send(&self.config.channel, payload);
        bounded(self.config.publish_timeout, send)
            .await
            .unwrap_or(Err(PublishError::Timeout(self.config.publish_timeout)))
    }

    /// Roll back `unit`. A failed rollback is only logged; the caller returns
    /// the error that caused the abort.
    async fn abort(&self, unit: S::Unit) {
        match bounded(self.config.store_timeout, unit.rollback()).await {
            Some(Ok(())) => debug!("unit of work rolled back"),
            Some(Err(e)) => error!(error = %e, "rollback failed"),
            None => error!(
                timeout = ?self.config.store_timeout,
                "rollback timed out, unit dropped"
            ),
        }
    }
}

/// `None` when `budget` elapsed before `call` finished.
async fn bounded<F: Future>(budget: Duration, call: F) -> Option<F::Output> {
    tokio::time::timeout(budget, call).await.ok()
}
