//! Job message queue (mechanics only).
//!
//! The queue carries job-ID references from the submitter to the workers.
//! Transports live behind [`MessageQueue`]; the in-memory queue here is for
//! tests/dev, the Redis Streams queue lives in `geotill-infra`.

pub mod in_memory;
pub mod message;
pub mod queue;

pub use in_memory::{InMemoryQueue, InMemoryQueueError};
pub use message::{JobMessage, MessageError};
pub use queue::{Delivery, MessageQueue};
