//! Job worker: turns one job-reference message into one finished job.
//!
//! ## Flow
//!
//! 1. Load the job; skip it if it is no longer `Pending`
//! 2. Claim it (`Pending → InProgress`) with a conditional datastore update
//! 3. Download the input into `<workdir>/jobs/<id>/input`, run the task binary,
//!    upload `<workdir>/jobs/<id>/output` as a new storage blob
//! 4. Persist the final status exactly once, whatever happened in step 3
//!
//! Errors before the claim leave the job untouched and are returned to the
//! caller. Errors after the claim are recorded on the job.

pub mod consumer;
pub mod toucher;

pub use consumer::{WorkerHandle, WorkerLoop, WorkerLoopConfig, WorkerStats};
pub use toucher::StorageToucher;

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use geotill_core::{DomainError, Job, JobId, Storage, StorageId, StorageStatus};
use geotill_queue::JobMessage;

use crate::datastore::{Datastore, DatastoreError};
use crate::objectstore::{Object, ObjectStore, ObjectStoreError};
use crate::task_runner::{TaskError, TaskInvocation, TaskRunner};
use crate::volume::{InputPolicy, VolumeError};
use crate::workspace::JobWorkspace;

/// Worker failure.
///
/// The `Display` text of an error raised after the claim becomes the job's
/// `error` field, so task failures render as the bare task message.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("{0}")]
    TaskExecution(String),

    #[error("no input found")]
    NoInputFound,

    #[error("ambiguous input: {0}")]
    AmbiguousInput(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<DatastoreError> for WorkerError {
    fn from(err: DatastoreError) -> Self {
        match err {
            DatastoreError::NotFound { .. } => WorkerError::NotFound(err.to_string()),
            other => WorkerError::Upstream(other.to_string()),
        }
    }
}

impl From<ObjectStoreError> for WorkerError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(_) => WorkerError::NotFound(err.to_string()),
            ObjectStoreError::Io(e) => WorkerError::Io(e.to_string()),
            ObjectStoreError::Volume(e) => e.into(),
            ObjectStoreError::Backend(_) => WorkerError::Upstream(err.to_string()),
        }
    }
}

impl From<VolumeError> for WorkerError {
    fn from(err: VolumeError) -> Self {
        match err {
            VolumeError::Empty => WorkerError::NoInputFound,
            VolumeError::Ambiguous { .. } => WorkerError::AmbiguousInput(err.to_string()),
            VolumeError::Io(_) | VolumeError::Walk(_) => WorkerError::Io(err.to_string()),
        }
    }
}

impl From<TaskError> for WorkerError {
    fn from(err: TaskError) -> Self {
        WorkerError::TaskExecution(err.to_string())
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        WorkerError::Io(err.to_string())
    }
}

/// What became of a handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job was not pending; nothing was done.
    AlreadyHandled,
    Completed { output_id: StorageId },
    Failed { error: String },
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Root of the per-job working directories.
    pub workdir: PathBuf,
    pub input_policy: InputPolicy,
}

impl WorkerConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            input_policy: InputPolicy::default(),
        }
    }

    pub fn with_input_policy(mut self, policy: InputPolicy) -> Self {
        self.input_policy = policy;
        self
    }
}

/// Message handler for job references.
#[derive(Debug)]
pub struct Worker<D, O, R> {
    datastore: D,
    object_store: O,
    runner: R,
    config: WorkerConfig,
    toucher: StorageToucher,
}

impl<D, O, R> Worker<D, O, R>
where
    D: Datastore + Clone + 'static,
    O: ObjectStore,
    R: TaskRunner,
{
    pub fn new(datastore: D, object_store: O, runner: R, config: WorkerConfig) -> io::Result<Self> {
        let toucher = StorageToucher::spawn(datastore.clone())?;
        Ok(Self {
            datastore,
            object_store,
            runner,
            config,
            toucher,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Wait for pending storage touches to be written (tests and shutdown).
    pub fn flush_touches(&self) {
        self.toucher.flush();
    }

    /// Handle one job-reference message.
    ///
    /// `Err` means the job could not be claimed or its final state could not
    /// be persisted; the message should be redelivered.
    pub fn handle(&self, message: &JobMessage) -> Result<Outcome, WorkerError> {
        let job_id = message.id();
        info!(job_id = %job_id, "processing message");

        let job = self.datastore.get_job(job_id)?;
        if job.is_handled() {
            debug!(job_id = %job_id, status = %job.status, "job already handled");
            return Ok(Outcome::AlreadyHandled);
        }

        let Some(mut job) = self.datastore.claim_job(job_id, Utc::now())? else {
            debug!(job_id = %job_id, "job claimed elsewhere");
            return Ok(Outcome::AlreadyHandled);
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&job)));

        let now = Utc::now();
        let outcome = match result {
            Ok(Ok(output_id)) => {
                job.complete(output_id, now)?;
                Outcome::Completed { output_id }
            }
            Ok(Err(err)) => {
                job.fail(err.to_string(), now)?;
                Outcome::Failed {
                    error: job.error.clone().unwrap_or_default(),
                }
            }
            Err(payload) => {
                let message = format!("task panicked: {}", panic_message(payload.as_ref()));
                job.fail(message, now)?;
                Outcome::Failed {
                    error: job.error.clone().unwrap_or_default(),
                }
            }
        };

        match &outcome {
            Outcome::Failed { error } => warn!(job_id = %job_id, error = %error, "job finished with status error"),
            _ => info!(job_id = %job_id, status = %job.status, "job finished"),
        }

        self.datastore.update_job(&job).map_err(|e| {
            error!(job_id = %job_id, error = %e, "failed to persist final job state");
            WorkerError::Upstream(e.to_string())
        })?;
        Ok(outcome)
    }

    /// Everything between the claim and the final persist.
    fn execute(&self, job: &Job) -> Result<StorageId, WorkerError> {
        let task = self.datastore.get_task_by_job_id(job.id).map_err(|e| {
            if e.is_not_found() {
                WorkerError::UnknownTask(job.task_type.to_string())
            } else {
                e.into()
            }
        })?;
        task.validate_args(&job.args)?;

        let workspace = JobWorkspace::create(&self.config.workdir, job.id)?;

        debug!(job_id = %job.id, storage_id = %job.input_id, "downloading input");
        let input = self.object_store.get_object(job.input_id)?;
        input.download(workspace.input())?;
        self.toucher.touch(job.input_id);

        let input_file = workspace.input().select_input(self.config.input_policy)?;

        self.runner.run(&TaskInvocation {
            job_id: job.id,
            command: task.command().to_string(),
            input: input_file,
            output_dir: workspace.output().path().to_path_buf(),
            args: job.args.clone(),
        })?;

        self.publish_output(job, &workspace)
    }

    fn publish_output(&self, job: &Job, workspace: &JobWorkspace) -> Result<StorageId, WorkerError> {
        let job_id = job.id;
        let output = self
            .datastore
            .create_storage(&Storage::new(job.owner_id, None, StorageStatus::Processing))?;

        debug!(job_id = %job_id, storage_id = %output.id, "uploading output");
        if let Err(err) = self.object_store.put_object(output.id, workspace.output()) {
            self.mark_unusable(job_id, &output);
            return Err(err.into());
        }

        let mut ready = output.clone();
        ready.status = StorageStatus::Ready;
        match self.datastore.update_storage(&ready) {
            Ok(ready) => Ok(ready.id),
            Err(err) => {
                self.mark_unusable(job_id, &output);
                Err(err.into())
            }
        }
    }

    /// Best effort: keep a half-published output from ever feeding a job.
    fn mark_unusable(&self, job_id: JobId, output: &Storage) {
        let mut unusable = output.clone();
        unusable.status = StorageStatus::Unusable;
        if let Err(e) = self.datastore.update_storage(&unusable) {
            warn!(job_id = %job_id, storage_id = %output.id, error = %e, "failed to mark output storage unusable");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
