//! Infrastructure layer: outbox store, transport publisher, engine and scheduler.
//!
//! - [`store`]: transactional units of work over the outbox table (Postgres, in-memory)
//! - [`publisher`]: payload transport (Redis pub/sub behind the `redis` feature, in-memory)
//! - [`engine`]: `enqueue` and batch `relay`
//! - [`scheduler`]: drives `relay` on a fixed cadence until shut down

pub mod config;
pub mod engine;
pub mod error;
pub mod publisher;
pub mod scheduler;
pub mod store;


pub use config::{ConfigError, PostgresConfig, RedisConfig, RelayConfig};
pub use engine::{OutboxEngine, RelayReport};
pub use error::{OutboxError, OutboxResult};
pub use scheduler::{RelayScheduler, SchedulerHandle, SchedulerStats};
