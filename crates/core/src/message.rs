//! Outbox message model and its lifecycle state machine.
//!
//! A message is created `pending` and moves to `processed` exactly once:
//!
//! ```text
//! pending ──mark_processed(at)──▶ processed
//! ```
//!
//! `processed_at` is set if and only if the status is `processed`. Both rules are
//! enforced by construction: fields are private, `restore` validates persisted
//! rows, and `mark_processed` refuses a second transition.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::MessageId;

/// Delivery status of an outbox message.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Stored, waiting to be relayed.
    #[default]
    Pending,
    /// Published to the transport and marked done.
    Processed,
}

impl MessageStatus {
    /// Persisted string form (`"pending"` / `"processed"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processed => "processed",
        }
    }
}

impl core::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processed" => Ok(MessageStatus::Processed),
            other => Err(DomainError::validation(format!(
                "unknown message status '{other}'"
            ))),
        }
    }
}

/// A persisted outbox record.
///
/// Deserialization goes through [`Message::restore`], so a record whose
/// `processed_at` disagrees with its status is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MessageRecord")]
pub struct Message {
    id: MessageId,
    payload: String,
    status: MessageStatus,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Wire shape of [`Message`] before invariant checks.
#[derive(Deserialize)]
struct MessageRecord {
    id: MessageId,
    payload: String,
    status: MessageStatus,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = DomainError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        Message::restore(
            record.id,
            record.payload,
            record.status,
            record.processed_at,
            record.created_at,
            record.updated_at,
        )
    }
}

impl Message {
    /// Create a new pending message stamped with the current time.
    pub fn new(payload: impl Into<String>) -> Self {
        Self::new_at(payload, Utc::now())
    }

    /// Create a new pending message with an explicit creation time.
    pub fn new_at(payload: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            payload: payload.into(),
            status: MessageStatus::Pending,
            processed_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Rebuild a message from persisted columns.
    ///
    /// Rejects rows where `processed_at` disagrees with `status`.
    pub fn restore(
        id: MessageId,
        payload: String,
        status: MessageStatus,
        processed_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        match (status, processed_at) {
            (MessageStatus::Pending, Some(_)) => {
                return Err(DomainError::invariant(format!(
                    "message {id} is pending but has processed_at set"
                )));
            }
            (MessageStatus::Processed, None) => {
                return Err(DomainError::invariant(format!(
                    "message {id} is processed but has no processed_at"
                )));
            }
            _ => {}
        }

        Ok(Self {
            id,
            payload,
            status,
            processed_at,
            created_at,
            updated_at,
        })
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    pub fn is_processed(&self) -> bool {
        self.status == MessageStatus::Processed
    }

    /// Transition `pending → processed`, stamping `processed_at` and `updated_at`.
    pub fn mark_processed(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.is_processed() {
            return Err(DomainError::invariant(format!(
                "message {} is already processed",
                self.id
            )));
        }

        self.status = MessageStatus::Processed;
        self.processed_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    /// Order used when fetching pending batches: oldest first, id as tiebreak.
    pub fn fifo_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}
