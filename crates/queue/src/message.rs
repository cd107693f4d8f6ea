//! Message payload carried by the queue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use geotill_core::JobId;

/// Reference to a job that needs executing.
///
/// Only the ID travels; the datastore row is the source of truth.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobMessage {
    id: JobId,
}

#[derive(Debug, Error)]
#[error("malformed job message: {0}")]
pub struct MessageError(#[from] serde_json::Error);

impl JobMessage {
    pub fn new(id: JobId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// JSON wire form.
    pub fn to_payload(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(payload)?)
    }
}

impl From<JobId> for JobMessage {
    fn from(id: JobId) -> Self {
        Self::new(id)
    }
}
