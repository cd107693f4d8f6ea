//! In-memory queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::message::JobMessage;
use crate::queue::{Delivery, MessageQueue};

/// Default number of deliveries before a message is dead-lettered.
const DEFAULT_MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InMemoryQueueError {
    /// Internal lock poisoning.
    #[error("queue lock poisoned")]
    Poisoned,
    /// The delivery was already settled or never issued by this queue.
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<(JobMessage, u32)>,
    in_flight: HashMap<String, (JobMessage, u32)>,
    dead_letters: Vec<JobMessage>,
    next_tag: u64,
}

/// In-memory at-least-once queue.
///
/// - No IO
/// - FIFO for fresh messages; nacked messages go to the back
/// - Messages nacked `max_deliveries` times are moved to a dead-letter list
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    available: Condvar,
    max_deliveries: u32,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_max_deliveries(DEFAULT_MAX_DELIVERIES)
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Messages waiting to be received.
    pub fn ready_len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages received but not yet settled.
    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<JobMessage> {
        self.lock().map(|s| s.dead_letters.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, InMemoryQueueError> {
        self.state.lock().map_err(|_| InMemoryQueueError::Poisoned)
    }

    fn settle(&self, delivery: &Delivery) -> Result<(MutexGuard<'_, State>, JobMessage, u32), InMemoryQueueError> {
        let mut state = self.lock()?;
        let (message, attempt) = state
            .in_flight
            .remove(delivery.tag())
            .ok_or_else(|| InMemoryQueueError::UnknownDelivery(delivery.tag().to_string()))?;
        Ok((state, message, attempt))
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue for InMemoryQueue {
    type Error = InMemoryQueueError;

    fn send(&self, message: JobMessage) -> Result<(), Self::Error> {
        let mut state = self.lock()?;
        state.ready.push_back((message, 0));
        self.available.notify_one();
        Ok(())
    }

    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, Self::Error> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock()?;

        loop {
            if let Some((message, delivered)) = state.ready.pop_front() {
                let attempt = delivered + 1;
                state.next_tag += 1;
                let tag = state.next_tag.to_string();
                state.in_flight.insert(tag.clone(), (message, attempt));
                return Ok(Some(Delivery::new(tag, message, attempt)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            state = self
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| InMemoryQueueError::Poisoned)?
                .0;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        self.settle(delivery).map(|_| ())
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        let (mut state, message, attempt) = self.settle(delivery)?;

        if attempt >= self.max_deliveries {
            warn!(
                job_id = %message.id(),
                attempts = attempt,
                "message dead-lettered after max deliveries"
            );
            state.dead_letters.push(message);
        } else {
            state.ready.push_back((message, attempt));
            self.available.notify_one();
        }

        Ok(())
    }
}
