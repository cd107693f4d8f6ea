//! Datastore boundary: jobs, storage records and task definitions.
//!
//! The worker and janitor only talk to the datastore through [`Datastore`].
//! The contract is synchronous; adapters backed by async drivers bridge onto
//! their runtime internally.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryDatastore;
pub use postgres::PostgresDatastore;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use geotill_core::{Job, JobId, Storage, StorageId, Task, TaskType};

/// Datastore operation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatastoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// A row could not be mapped back into the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Connection, query or pool failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl DatastoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DatastoreError::NotFound { .. })
    }
}

/// Job, storage and task persistence as required by the worker, the janitor
/// and the submitter.
pub trait Datastore: Send + Sync {
    /// Persist a new job.
    fn create_job(&self, job: &Job) -> Result<Job, DatastoreError>;

    fn get_job(&self, id: JobId) -> Result<Job, DatastoreError>;

    /// Overwrite the mutable fields of a job (status, error, output, times).
    fn update_job(&self, job: &Job) -> Result<Job, DatastoreError>;

    /// Atomically move a job from `Pending` to `InProgress`.
    ///
    /// Returns `None` if the job is no longer pending (another worker claimed
    /// it first, or it already finished).
    fn claim_job(&self, id: JobId, at: DateTime<Utc>) -> Result<Option<Job>, DatastoreError>;

    /// Jobs whose `end_time` is older than `retention`.
    fn get_jobs_before(&self, retention: Duration) -> Result<Vec<Job>, DatastoreError>;

    fn delete_job(&self, id: JobId) -> Result<(), DatastoreError>;

    fn create_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError>;

    fn get_storage(&self, id: StorageId) -> Result<Storage, DatastoreError>;

    /// Overwrite name and status; `last_used` is refreshed as part of the write.
    fn update_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError>;

    /// Refresh `last_used` only.
    fn touch_storage(&self, id: StorageId) -> Result<Storage, DatastoreError>;

    /// Storage whose `last_used` is older than `retention`.
    fn get_storage_before(&self, retention: Duration) -> Result<Vec<Storage>, DatastoreError>;

    fn delete_storage(&self, id: StorageId) -> Result<(), DatastoreError>;

    fn get_task(&self, task_type: TaskType) -> Result<Task, DatastoreError>;

    fn get_task_by_job_id(&self, id: JobId) -> Result<Task, DatastoreError>;
}

impl<D> Datastore for Arc<D>
where
    D: Datastore + ?Sized,
{
    fn create_job(&self, job: &Job) -> Result<Job, DatastoreError> {
        (**self).create_job(job)
    }

    fn get_job(&self, id: JobId) -> Result<Job, DatastoreError> {
        (**self).get_job(id)
    }

    fn update_job(&self, job: &Job) -> Result<Job, DatastoreError> {
        (**self).update_job(job)
    }

    fn claim_job(&self, id: JobId, at: DateTime<Utc>) -> Result<Option<Job>, DatastoreError> {
        (**self).claim_job(id, at)
    }

    fn get_jobs_before(&self, retention: Duration) -> Result<Vec<Job>, DatastoreError> {
        (**self).get_jobs_before(retention)
    }

    fn delete_job(&self, id: JobId) -> Result<(), DatastoreError> {
        (**self).delete_job(id)
    }

    fn create_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError> {
        (**self).create_storage(storage)
    }

    fn get_storage(&self, id: StorageId) -> Result<Storage, DatastoreError> {
        (**self).get_storage(id)
    }

    fn update_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError> {
        (**self).update_storage(storage)
    }

    fn touch_storage(&self, id: StorageId) -> Result<Storage, DatastoreError> {
        (**self).touch_storage(id)
    }

    fn get_storage_before(&self, retention: Duration) -> Result<Vec<Storage>, DatastoreError> {
        (**self).get_storage_before(retention)
    }

    fn delete_storage(&self, id: StorageId) -> Result<(), DatastoreError> {
        (**self).delete_storage(id)
    }

    fn get_task(&self, task_type: TaskType) -> Result<Task, DatastoreError> {
        (**self).get_task(task_type)
    }

    fn get_task_by_job_id(&self, id: JobId) -> Result<Task, DatastoreError> {
        (**self).get_task_by_job_id(id)
    }
}

/// Instant before which a row counts as expired for the given retention.
pub(crate) fn retention_cutoff(retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
