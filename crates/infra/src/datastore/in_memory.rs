//! In-memory datastore for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use geotill_core::{Job, JobId, JobStatus, Storage, StorageId, Task, TaskType};

use super::{Datastore, DatastoreError, retention_cutoff};

/// In-memory datastore.
///
/// Mirrors the Postgres adapter's semantics: conditional claims, monotonic
/// `last_used`, and deletes that do not cascade.
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    jobs: RwLock<HashMap<JobId, Job>>,
    storage: RwLock<HashMap<StorageId, Storage>>,
    tasks: RwLock<HashMap<TaskType, Task>>,
}

fn poisoned() -> DatastoreError {
    DatastoreError::Backend("lock poisoned".to_string())
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, DatastoreError> {
    lock.read().map_err(|_| poisoned())
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, DatastoreError> {
    lock.write().map_err(|_| poisoned())
}

impl InMemoryDatastore {
    /// Empty datastore with no task definitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Datastore seeded with the stock definition of every task type.
    pub fn with_builtin_tasks() -> Self {
        let store = Self::new();
        if let Ok(mut tasks) = store.tasks.write() {
            for task_type in TaskType::ALL {
                tasks.insert(task_type, Task::builtin(task_type));
            }
        }
        store
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::with_builtin_tasks())
    }

    pub fn put_task(&self, task: Task) -> Result<(), DatastoreError> {
        write(&self.tasks)?.insert(task.task_type, task);
        Ok(())
    }

    pub fn remove_task(&self, task_type: TaskType) -> Result<(), DatastoreError> {
        write(&self.tasks)?.remove(&task_type);
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn storage_count(&self) -> usize {
        self.storage.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Overwrite a job's end time directly (retention tests).
    pub fn set_job_end_time(&self, id: JobId, at: DateTime<Utc>) -> Result<(), DatastoreError> {
        let mut jobs = write(&self.jobs)?;
        let job = jobs.get_mut(&id).ok_or_else(|| DatastoreError::not_found("job", id))?;
        job.end_time = Some(at);
        Ok(())
    }

    /// Overwrite a storage record's `last_used` directly, bypassing monotonicity (retention tests).
    pub fn set_storage_last_used(&self, id: StorageId, at: DateTime<Utc>) -> Result<(), DatastoreError> {
        let mut storage = write(&self.storage)?;
        let s = storage
            .get_mut(&id)
            .ok_or_else(|| DatastoreError::not_found("storage", id))?;
        s.last_used = at;
        Ok(())
    }
}

impl Datastore for InMemoryDatastore {
    fn create_job(&self, job: &Job) -> Result<Job, DatastoreError> {
        let mut jobs = write(&self.jobs)?;
        if jobs.contains_key(&job.id) {
            return Err(DatastoreError::AlreadyExists {
                entity: "job",
                id: job.id.to_string(),
            });
        }
        jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    fn get_job(&self, id: JobId) -> Result<Job, DatastoreError> {
        read(&self.jobs)?
            .get(&id)
            .cloned()
            .ok_or_else(|| DatastoreError::not_found("job", id))
    }

    fn update_job(&self, job: &Job) -> Result<Job, DatastoreError> {
        let mut jobs = write(&self.jobs)?;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| DatastoreError::not_found("job", job.id))?;

        stored.status = job.status;
        stored.error = job.error.clone();
        stored.output_id = job.output_id;
        stored.start_time = job.start_time;
        stored.end_time = job.end_time;
        Ok(stored.clone())
    }

    fn claim_job(&self, id: JobId, at: DateTime<Utc>) -> Result<Option<Job>, DatastoreError> {
        let mut jobs = write(&self.jobs)?;
        let job = jobs.get_mut(&id).ok_or_else(|| DatastoreError::not_found("job", id))?;

        // Only a Pending job can start; anything else lost the race.
        if job.start(at).is_err() {
            return Ok(None);
        }
        Ok(Some(job.clone()))
    }

    fn get_jobs_before(&self, retention: Duration) -> Result<Vec<Job>, DatastoreError> {
        let cutoff = retention_cutoff(retention);
        let mut result: Vec<_> = read(&self.jobs)?
            .values()
            .filter(|j| j.end_time.is_some_and(|end| end < cutoff))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.end_time);
        Ok(result)
    }

    fn delete_job(&self, id: JobId) -> Result<(), DatastoreError> {
        write(&self.jobs)?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DatastoreError::not_found("job", id))
    }

    fn create_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError> {
        let mut all = write(&self.storage)?;
        if all.contains_key(&storage.id) {
            return Err(DatastoreError::AlreadyExists {
                entity: "storage",
                id: storage.id.to_string(),
            });
        }
        all.insert(storage.id, storage.clone());
        Ok(storage.clone())
    }

    fn get_storage(&self, id: StorageId) -> Result<Storage, DatastoreError> {
        read(&self.storage)?
            .get(&id)
            .cloned()
            .ok_or_else(|| DatastoreError::not_found("storage", id))
    }

    fn update_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError> {
        let mut all = write(&self.storage)?;
        let stored = all
            .get_mut(&storage.id)
            .ok_or_else(|| DatastoreError::not_found("storage", storage.id))?;

        stored.name = storage.name.clone();
        stored.status = storage.status;
        stored.touch(Utc::now());
        Ok(stored.clone())
    }

    fn touch_storage(&self, id: StorageId) -> Result<Storage, DatastoreError> {
        let mut all = write(&self.storage)?;
        let stored = all
            .get_mut(&id)
            .ok_or_else(|| DatastoreError::not_found("storage", id))?;
        stored.touch(Utc::now());
        Ok(stored.clone())
    }

    fn get_storage_before(&self, retention: Duration) -> Result<Vec<Storage>, DatastoreError> {
        let cutoff = retention_cutoff(retention);
        let mut result: Vec<_> = read(&self.storage)?
            .values()
            .filter(|s| s.last_used < cutoff)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.last_used);
        Ok(result)
    }

    fn delete_storage(&self, id: StorageId) -> Result<(), DatastoreError> {
        write(&self.storage)?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DatastoreError::not_found("storage", id))
    }

    fn get_task(&self, task_type: TaskType) -> Result<Task, DatastoreError> {
        read(&self.tasks)?
            .get(&task_type)
            .cloned()
            .ok_or_else(|| DatastoreError::not_found("task", task_type))
    }

    fn get_task_by_job_id(&self, id: JobId) -> Result<Task, DatastoreError> {
        let task_type = self.get_job(id)?.task_type;
        self.get_task(task_type)
    }
}
