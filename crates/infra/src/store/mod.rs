//! Transactional outbox store boundary.
//!
//! The engine only talks to [`OutboxStore`] / [`UnitOfWork`]; concrete
//! backends are an in-memory store (tests/dev) and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryOutboxStore, InMemoryUnitOfWork, StoreFault};
pub use postgres::{PostgresOutboxStore, PostgresUnitOfWork};
pub use r#trait::{OutboxStore, StoreError, UnitOfWork};
