use thiserror::Error;

use crate::config::ConfigError;
use crate::publisher::PublishError;
use crate::store::StoreError;

/// Error returned by the outbox engine.
///
/// Every failure of a unit-of-work step lands in one of three buckets so
/// callers can decide whether the store or the transport is at fault.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("transport failure: {0}")]
    Transport(#[from] PublishError),

    #[error("configuration failure: {0}")]
    Configuration(#[from] ConfigError),
}

impl OutboxError {
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;
