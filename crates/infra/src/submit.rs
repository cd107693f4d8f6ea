//! Job submission: the producer side of the worker queue.

use thiserror::Error;
use tracing::info;

use geotill_core::{DomainError, Job, OwnerId, StorageId, TaskType};
use geotill_queue::{JobMessage, MessageQueue};

use crate::datastore::{Datastore, DatastoreError};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskType),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage {storage_id} does not belong to owner {owner_id}")]
    Forbidden {
        storage_id: StorageId,
        owner_id: OwnerId,
    },

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("datastore error: {0}")]
    Datastore(DatastoreError),

    /// The job was persisted but could not be enqueued.
    #[error("failed to enqueue job: {0}")]
    Queue(String),
}

impl From<DatastoreError> for SubmitError {
    fn from(err: DatastoreError) -> Self {
        if err.is_not_found() {
            SubmitError::NotFound(err.to_string())
        } else {
            SubmitError::Datastore(err)
        }
    }
}

/// Creates pending jobs and enqueues them for the workers.
#[derive(Debug, Clone)]
pub struct JobSubmitter<D, Q> {
    datastore: D,
    queue: Q,
}

impl<D, Q> JobSubmitter<D, Q>
where
    D: Datastore,
    Q: MessageQueue,
{
    pub fn new(datastore: D, queue: Q) -> Self {
        Self { datastore, queue }
    }

    pub fn submit(
        &self,
        owner_id: OwnerId,
        task_type: TaskType,
        args: Vec<String>,
        input_id: StorageId,
    ) -> Result<Job, SubmitError> {
        let task = self.datastore.get_task(task_type).map_err(|e| {
            if e.is_not_found() {
                SubmitError::UnknownTask(task_type)
            } else {
                SubmitError::Datastore(e)
            }
        })?;
        task.validate_args(&args)?;

        let input = self.datastore.get_storage(input_id)?;
        if input.owner_id != owner_id {
            return Err(SubmitError::Forbidden {
                storage_id: input_id,
                owner_id,
            });
        }
        input.ensure_usable_as_input()?;

        let job = self
            .datastore
            .create_job(&Job::new(owner_id, task_type, args, input_id))?;

        self.queue
            .send(JobMessage::new(job.id))
            .map_err(|e| SubmitError::Queue(e.to_string()))?;

        info!(job_id = %job.id, task_type = %task_type, storage_id = %input_id, "job submitted");
        Ok(job)
    }
}
