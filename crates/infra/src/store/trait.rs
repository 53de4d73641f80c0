use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use outbox_core::{DomainError, Message, MessageId};

/// Outbox store operation error.
///
/// These are **infrastructure errors** (storage, connectivity, timeouts) as
/// opposed to domain errors (validation, invariants). The engine surfaces all
/// of them as a persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The message does not exist (or is no longer pending) in this unit of work.
    #[error("message not found or no longer pending: {0}")]
    NotFound(MessageId),

    /// A constraint was violated (e.g. duplicate id).
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The per-call time budget elapsed.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A persisted row violated a message invariant.
    #[error("invalid stored message: {0}")]
    Invalid(#[from] DomainError),

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Factory for transactional units of work over the outbox table.
///
/// The store itself holds no transaction; every read and write goes through a
/// [`UnitOfWork`] obtained from [`OutboxStore::begin`].
///
/// ## Implementation Requirements
///
/// - Units must be isolated: work staged in one unit is invisible to others
///   until it commits.
/// - `commit` applies all staged work atomically (all or nothing).
/// - Dropping a unit without calling `commit` discards its work.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Unit: UnitOfWork;

    /// Open a new isolated transactional context.
    async fn begin(&self) -> Result<Self::Unit, StoreError>;
}

/// A single transactional scope over the outbox table.
///
/// The handle is exclusively owned by the flow that opened it. `commit` and
/// `rollback` consume it, so every unit is terminated at most once.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Insert a new message. The message must be pending.
    async fn create(&mut self, message: &Message) -> Result<(), StoreError>;

    /// Up to `limit` pending messages, oldest first (`created_at`, then `id`).
    async fn find_pending(&mut self, limit: usize) -> Result<Vec<Message>, StoreError>;

    /// Set `status = processed` and `processed_at = now`.
    ///
    /// Fails with [`StoreError::NotFound`] when the message is missing or was
    /// already processed.
    async fn mark_processed(&mut self, message: &Message) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    type Unit = S::Unit;

    async fn begin(&self) -> Result<Self::Unit, StoreError> {
        (**self).begin().await
    }
}
