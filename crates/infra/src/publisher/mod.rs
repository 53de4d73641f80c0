//! Transport publisher boundary.
//!
//! [`Publisher`] is the only transport surface the engine sees. The in-memory
//! implementation backs tests/dev; Redis pub/sub is available behind the
//! `redis` feature.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_pubsub;
pub mod r#trait;

pub use in_memory::{Delivery, InMemoryPublisher};
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPublisher;
pub use r#trait::{PublishError, Publisher};
