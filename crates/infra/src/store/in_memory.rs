use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outbox_core::{Message, MessageId};

use super::r#trait::{OutboxStore, StoreError, UnitOfWork};

/// A one-shot failure to inject into the next matching store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFault {
    Begin,
    Create,
    FindPending,
    MarkProcessed(MessageId),
    Commit,
}

#[derive(Debug, Default)]
struct Shared {
    /// Committed messages in commit order.
    messages: RwLock<Vec<Message>>,
    faults: Mutex<Vec<StoreFault>>,
    latency: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
}

impl Shared {
    fn take_fault(&self, wanted: &StoreFault) -> Result<(), StoreError> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        if let Some(pos) = faults.iter().position(|f| f == wanted) {
            faults.remove(pos);
            return Err(StoreError::Backend(format!("injected fault: {wanted:?}")));
        }
        Ok(())
    }

    /// Common prologue of every call: latency, availability, injected fault.
    async fn enter(&self, fault: StoreFault) -> Result<(), StoreError> {
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }

        self.take_fault(&fault)
    }
}

/// In-memory transactional outbox store.
///
/// Intended for tests/dev. Clones share the same underlying state, so a test
/// can keep a handle for inspection while the engine owns another.
///
/// Each [`InMemoryUnitOfWork`] stages its inserts and status updates locally
/// and applies them atomically on commit; dropping or rolling back a unit
/// discards them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    shared: Arc<Shared>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call matching `fault` (one shot).
    pub fn inject(&self, fault: StoreFault) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.push(fault);
        }
    }

    /// Delay every store call by `latency` (`None` to disable).
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut l) = self.shared.latency.lock() {
            *l = latency;
        }
    }

    /// Simulate a lost database connection.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Committed view of a single message.
    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.shared
            .messages
            .read()
            .ok()?
            .iter()
            .find(|m| m.id() == id)
            .cloned()
    }

    /// All committed messages in commit order.
    pub fn all(&self) -> Vec<Message> {
        self.shared
            .messages
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.all().iter().filter(|m| m.is_pending()).count()
    }

    pub fn processed_count(&self) -> usize {
        self.all().iter().filter(|m| m.is_processed()).count()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Unit = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::Unit, StoreError> {
        self.shared.enter(StoreFault::Begin).await?;

        Ok(InMemoryUnitOfWork {
            shared: self.shared.clone(),
            inserts: Vec::new(),
            processed: Vec::new(),
        })
    }
}

/// Unit of work over [`InMemoryOutboxStore`].
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    shared: Arc<Shared>,
    inserts: Vec<Message>,
    processed: Vec<(MessageId, DateTime<Utc>)>,
}

impl InMemoryUnitOfWork {
    fn staged_processed(&self) -> HashSet<MessageId> {
        self.processed.iter().map(|(id, _)| *id).collect()
    }

    /// Pending messages as seen from inside this unit.
    fn pending_view(&self) -> Result<Vec<Message>, StoreError> {
        let committed = self
            .shared
            .messages
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        let processed = self.staged_processed();

        Ok(committed
            .iter()
            .chain(self.inserts.iter())
            .filter(|m| m.is_pending() && !processed.contains(&m.id()))
            .cloned()
            .collect())
    }

    fn id_exists(&self, id: MessageId) -> Result<bool, StoreError> {
        let committed = self
            .shared
            .messages
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        Ok(committed.iter().chain(self.inserts.iter()).any(|m| m.id() == id))
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn create(&mut self, message: &Message) -> Result<(), StoreError> {
        self.shared.enter(StoreFault::Create).await?;

        if !message.is_pending() {
            return Err(StoreError::Conflict(format!(
                "message {} must be created pending",
                message.id()
            )));
        }
        if self.id_exists(message.id())? {
            return Err(StoreError::Conflict(format!(
                "duplicate message id {}",
                message.id()
            )));
        }

        self.inserts.push(message.clone());
        Ok(())
    }

    async fn find_pending(&mut self, limit: usize) -> Result<Vec<Message>, StoreError> {
        self.shared.enter(StoreFault::FindPending).await?;

        let mut pending = self.pending_view()?;
        pending.sort_by_key(|m| m.fifo_key());
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_processed(&mut self, message: &Message) -> Result<(), StoreError> {
        self.shared
            .enter(StoreFault::MarkProcessed(message.id()))
            .await?;

        let visible = self.pending_view()?.iter().any(|m| m.id() == message.id());
        if !visible {
            return Err(StoreError::NotFound(message.id()));
        }

        self.processed.push((message.id(), Utc::now()));
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.shared.enter(StoreFault::Commit).await?;

        let mut committed = self
            .shared
            .messages
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        // Validate everything before applying anything (all or nothing).
        for insert in &self.inserts {
            if committed.iter().any(|m| m.id() == insert.id()) {
                return Err(StoreError::Conflict(format!(
                    "duplicate message id {}",
                    insert.id()
                )));
            }
        }
        for (id, _) in &self.processed {
            let still_pending = committed
                .iter()
                .chain(self.inserts.iter())
                .any(|m| m.id() == *id && m.is_pending());
            if !still_pending {
                return Err(StoreError::Conflict(format!(
                    "message {id} was processed by a concurrent unit of work"
                )));
            }
        }

        committed.extend(self.inserts);
        for (id, at) in self.processed {
            if let Some(message) = committed.iter_mut().find(|m| m.id() == id) {
                message.mark_processed(at)?;
            }
        }

        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        // Staged work lives only in this unit; dropping it is the rollback.
        Ok(())
    }
}
