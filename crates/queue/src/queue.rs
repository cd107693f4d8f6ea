//! Queue abstraction.
//!
//! ## Delivery Guarantees
//!
//! Queues provide **at-least-once delivery**:
//! - A received message stays owned by the queue until it is acknowledged
//! - `nack` (or a consumer crash) makes the message eligible for redelivery
//! - Consumers must be idempotent (the worker checks job status first)
//!
//! How often and how soon a message is redelivered is the queue's policy, not
//! the consumer's.

use std::sync::Arc;
use std::time::Duration;

use crate::message::JobMessage;

/// A received message together with the handle needed to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    tag: String,
    message: JobMessage,
    attempt: u32,
}

impl Delivery {
    pub fn new(tag: impl Into<String>, message: JobMessage, attempt: u32) -> Self {
        Self {
            tag: tag.into(),
            message,
            attempt,
        }
    }

    /// Transport-specific delivery handle (e.g. a stream entry ID).
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn message(&self) -> &JobMessage {
        &self.message
    }

    /// 1 for the first delivery, incremented on every redelivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Durable job-reference channel between the submitter and the workers.
///
/// Implementations must be safe to share across threads: submitters and any
/// number of worker loops may use the same queue concurrently.
pub trait MessageQueue: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Enqueue a job reference.
    fn send(&self, message: JobMessage) -> Result<(), Self::Error>;

    /// Wait up to `wait` for the next delivery.
    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, Self::Error>;

    /// Settle a delivery as processed.
    fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error>;

    /// Hand a delivery back for redelivery.
    fn nack(&self, delivery: &Delivery) -> Result<(), Self::Error>;
}

impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    type Error = Q::Error;

    fn send(&self, message: JobMessage) -> Result<(), Self::Error> {
        (**self).send(message)
    }

    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, Self::Error> {
        (**self).receive(wait)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        (**self).ack(delivery)
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        (**self).nack(delivery)
    }
}
