//! Infrastructure-backed [`MessageQueue`](geotill_queue::MessageQueue)
//! implementations.
//!
//! The queue abstraction and the in-memory queue live in `geotill-queue`.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsQueue};
