//! `outbox-core`: outbox domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the message identity, its lifecycle state machine and the domain error model.

pub mod error;
pub mod id;
pub mod message;

pub use error::{DomainError, DomainResult};
pub use id::MessageId;
pub use message::{Message, MessageStatus};
