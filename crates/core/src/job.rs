//! Job model and its status machine.
//!
//! `Pending → InProgress → {Complete | Error}`. Complete and Error are terminal.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, OwnerId, StorageId};
use crate::task::TaskType;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted and enqueued, not yet picked up
    Pending,
    /// Claimed by a worker
    InProgress,
    /// Finished successfully; `output_id` is set
    Complete,
    /// Finished unsuccessfully; `error` is set
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "complete" => Ok(JobStatus::Complete),
            "error" => Ok(JobStatus::Error),
            other => Err(DomainError::unknown("job status", other)),
        }
    }
}

/// One request to run a task over an input dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub task_type: TaskType,
    /// Positional task parameters, in the task's `params` order
    pub args: Vec<String>,
    pub input_id: StorageId,
    pub output_id: Option<StorageId>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(owner_id: OwnerId, task_type: TaskType, args: Vec<String>, input_id: StorageId) -> Self {
        Self {
            id: JobId::new(),
            owner_id,
            task_type,
            args,
            input_id,
            output_id: None,
            status: JobStatus::Pending,
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Whether a delivery for this job needs no further work.
    ///
    /// Anything past `Pending` is either owned by another worker or finished.
    pub fn is_handled(&self) -> bool {
        self.status != JobStatus::Pending
    }

    /// Mark job as in progress.
    pub fn start(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Pending, JobStatus::InProgress)?;
        self.status = JobStatus::InProgress;
        self.start_time = Some(at);
        Ok(())
    }

    /// Mark job as complete with the storage holding its output.
    pub fn complete(&mut self, output_id: StorageId, at: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::InProgress, JobStatus::Complete)?;
        self.status = JobStatus::Complete;
        self.output_id = Some(output_id);
        self.error = None;
        self.end_time = Some(at);
        Ok(())
    }

    /// Mark job as failed.
    ///
    /// An empty message is replaced so that an `Error` job always explains itself.
    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::InProgress, JobStatus::Error)?;
        let error = error.into();
        self.status = JobStatus::Error;
        self.output_id = None;
        self.error = Some(if error.trim().is_empty() {
            "job failed without a message".to_string()
        } else {
            error
        });
        self.end_time = Some(at);
        Ok(())
    }

    fn expect_status(&self, from: JobStatus, to: JobStatus) -> DomainResult<()> {
        if self.status == from {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, to
            )))
        }
    }
}
