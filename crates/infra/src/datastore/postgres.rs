//! Postgres-backed datastore.
//!
//! Tables (schema managed outside this crate):
//!
//! | table     | columns |
//! |-----------|---------|
//! | `job`     | `id, owner_id, task_type, args text[], input_id, output_id, status, error, start_time, end_time` |
//! | `storage` | `id, owner_id, name, status, last_used, create_time` |
//! | `task`    | `task_type, kind, params text[]` |
//!
//! ## Error Mapping
//!
//! | SQLx error | `DatastoreError` |
//! |------------|------------------|
//! | `RowNotFound` / empty `fetch_optional` | `NotFound` |
//! | Database (unique violation, `23505`) | `AlreadyExists` |
//! | Column decode / unknown enum value | `Corrupt` |
//! | Anything else | `Backend` |
//!
//! ## Threading
//!
//! The [`Datastore`] contract is synchronous. Calls are driven to completion on
//! the runtime behind the stored [`Handle`], so they must be made from threads
//! that are not themselves running async tasks (the worker and janitor threads).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{instrument, warn};
use uuid::Uuid;

use geotill_core::{Job, JobId, JobStatus, OwnerId, Storage, StorageId, Task, TaskType};

use super::{Datastore, DatastoreError, retention_cutoff};

const JOB_COLUMNS: &str =
    "id, owner_id, task_type, args, input_id, output_id, status, error, start_time, end_time";

const STORAGE_COLUMNS: &str = "id, owner_id, name, status, last_used, create_time";

/// Postgres-backed datastore.
#[derive(Debug, Clone)]
pub struct PostgresDatastore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresDatastore {
    /// Create a datastore over an existing pool, running queries on `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Open a pool, retrying the initial connection `retries` times.
    pub async fn connect(
        url: &str,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<PgPool, DatastoreError> {
        let mut attempt = 0;
        loop {
            match PgPoolOptions::new().max_connections(8).connect(url).await {
                Ok(pool) => return Ok(pool),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(attempt, retries, error = %e, "postgres connection failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
                Err(e) => return Err(map_sqlx_error("connect", e)),
            }
        }
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn fetch_jobs(&self, sql: &str, cutoff: DateTime<Utc>) -> Result<Vec<Job>, DatastoreError> {
        self.block_on(async {
            sqlx::query(sql)
                .bind(cutoff)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("fetch_jobs", e))?
                .iter()
                .map(job_from_row)
                .collect()
        })
    }
}

impl Datastore for PostgresDatastore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn create_job(&self, job: &Job) -> Result<Job, DatastoreError> {
        let sql = format!(
            "INSERT INTO job ({JOB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {JOB_COLUMNS}"
        );
        self.block_on(async {
            let row = sqlx::query(&sql)
                .bind(job.id.as_uuid())
                .bind(job.owner_id.as_uuid())
                .bind(job.task_type.as_str())
                .bind(&job.args)
                .bind(job.input_id.as_uuid())
                .bind(job.output_id.map(Uuid::from))
                .bind(job.status.as_str())
                .bind(job.error.as_deref())
                .bind(job.start_time)
                .bind(job.end_time)
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_job", e))?;
            job_from_row(&row)
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn get_job(&self, id: JobId) -> Result<Job, DatastoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1");
        self.block_on(async {
            sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_job", e))?
                .ok_or_else(|| DatastoreError::not_found("job", id))
                .and_then(|row| job_from_row(&row))
        })
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    fn update_job(&self, job: &Job) -> Result<Job, DatastoreError> {
        let sql = format!(
            "UPDATE job SET status = $2, error = $3, output_id = $4, start_time = $5, end_time = $6 \
             WHERE id = $1 RETURNING {JOB_COLUMNS}"
        );
        self.block_on(async {
            sqlx::query(&sql)
                .bind(job.id.as_uuid())
                .bind(job.status.as_str())
                .bind(job.error.as_deref())
                .bind(job.output_id.map(Uuid::from))
                .bind(job.start_time)
                .bind(job.end_time)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("update_job", e))?
                .ok_or_else(|| DatastoreError::not_found("job", job.id))
                .and_then(|row| job_from_row(&row))
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn claim_job(&self, id: JobId, at: DateTime<Utc>) -> Result<Option<Job>, DatastoreError> {
        let sql = format!(
            "UPDATE job SET status = $2, start_time = $3 \
             WHERE id = $1 AND status = $4 RETURNING {JOB_COLUMNS}"
        );
        let claimed = self.block_on(async {
            sqlx::query(&sql)
                .bind(id.as_uuid())
                .bind(JobStatus::InProgress.as_str())
                .bind(at)
                .bind(JobStatus::Pending.as_str())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("claim_job", e))
        })?;

        match claimed {
            Some(row) => job_from_row(&row).map(Some),
            // Distinguish "lost the race" from "no such job".
            None => self.get_job(id).map(|_| None),
        }
    }

    #[instrument(skip(self), err)]
    fn get_jobs_before(&self, retention: Duration) -> Result<Vec<Job>, DatastoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job WHERE end_time < $1 ORDER BY end_time");
        self.fetch_jobs(&sql, retention_cutoff(retention))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn delete_job(&self, id: JobId) -> Result<(), DatastoreError> {
        let result = self.block_on(async {
            sqlx::query("DELETE FROM job WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_job", e))
        })?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::not_found("job", id));
        }
        Ok(())
    }

    #[instrument(skip(self, storage), fields(storage_id = %storage.id), err)]
    fn create_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError> {
        let sql = format!(
            "INSERT INTO storage ({STORAGE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {STORAGE_COLUMNS}"
        );
        self.block_on(async {
            let row = sqlx::query(&sql)
                .bind(storage.id.as_uuid())
                .bind(storage.owner_id.as_uuid())
                .bind(storage.name.as_deref())
                .bind(storage.status.as_str())
                .bind(storage.last_used)
                .bind(storage.create_time)
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_storage", e))?;
            storage_from_row(&row)
        })
    }

    #[instrument(skip(self), fields(storage_id = %id), err)]
    fn get_storage(&self, id: StorageId) -> Result<Storage, DatastoreError> {
        let sql = format!("SELECT {STORAGE_COLUMNS} FROM storage WHERE id = $1");
        self.block_on(async {
            sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_storage", e))?
                .ok_or_else(|| DatastoreError::not_found("storage", id))
                .and_then(|row| storage_from_row(&row))
        })
    }

    #[instrument(skip(self, storage), fields(storage_id = %storage.id), err)]
    fn update_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError> {
        let sql = format!(
            "UPDATE storage SET name = $2, status = $3, last_used = GREATEST(last_used, $4) \
             WHERE id = $1 RETURNING {STORAGE_COLUMNS}"
        );
        self.block_on(async {
            sqlx::query(&sql)
                .bind(storage.id.as_uuid())
                .bind(storage.name.as_deref())
                .bind(storage.status.as_str())
                .bind(Utc::now())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("update_storage", e))?
                .ok_or_else(|| DatastoreError::not_found("storage", storage.id))
                .and_then(|row| storage_from_row(&row))
        })
    }

    #[instrument(skip(self), fields(storage_id = %id), err)]
    fn touch_storage(&self, id: StorageId) -> Result<Storage, DatastoreError> {
        let sql = format!(
            "UPDATE storage SET last_used = GREATEST(last_used, $2) \
             WHERE id = $1 RETURNING {STORAGE_COLUMNS}"
        );
        self.block_on(async {
            sqlx::query(&sql)
                .bind(id.as_uuid())
                .bind(Utc::now())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("touch_storage", e))?
                .ok_or_else(|| DatastoreError::not_found("storage", id))
                .and_then(|row| storage_from_row(&row))
        })
    }

    #[instrument(skip(self), err)]
    fn get_storage_before(&self, retention: Duration) -> Result<Vec<Storage>, DatastoreError> {
        let sql = format!(
            "SELECT {STORAGE_COLUMNS} FROM storage WHERE last_used < $1 ORDER BY last_used"
        );
        let cutoff = retention_cutoff(retention);
        self.block_on(async {
            sqlx::query(&sql)
                .bind(cutoff)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_storage_before", e))?
                .iter()
                .map(storage_from_row)
                .collect()
        })
    }

    #[instrument(skip(self), fields(storage_id = %id), err)]
    fn delete_storage(&self, id: StorageId) -> Result<(), DatastoreError> {
        let result = self.block_on(async {
            sqlx::query("DELETE FROM storage WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_storage", e))
        })?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::not_found("storage", id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(task_type = %task_type), err)]
    fn get_task(&self, task_type: TaskType) -> Result<Task, DatastoreError> {
        self.block_on(async {
            sqlx::query("SELECT task_type, kind, params FROM task WHERE task_type = $1")
                .bind(task_type.as_str())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_task", e))?
                .ok_or_else(|| DatastoreError::not_found("task", task_type))
                .and_then(|row| task_from_row(&row))
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn get_task_by_job_id(&self, id: JobId) -> Result<Task, DatastoreError> {
        self.block_on(async {
            sqlx::query(
                "SELECT t.task_type, t.kind, t.params FROM task t \
                 JOIN job j ON j.task_type = t.task_type WHERE j.id = $1",
            )
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task_by_job_id", e))?
            .ok_or_else(|| DatastoreError::not_found("task for job", id))
            .and_then(|row| task_from_row(&row))
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, DatastoreError> {
    Ok(Job {
        id: JobId::from_uuid(column(row, "id")?),
        owner_id: OwnerId::from_uuid(column(row, "owner_id")?),
        task_type: parse_column(row, "task_type")?,
        args: column(row, "args")?,
        input_id: StorageId::from_uuid(column(row, "input_id")?),
        output_id: column::<Option<Uuid>>(row, "output_id")?.map(StorageId::from_uuid),
        status: parse_column(row, "status")?,
        error: column::<Option<String>>(row, "error")?.filter(|e| !e.is_empty()),
        start_time: column(row, "start_time")?,
        end_time: column(row, "end_time")?,
    })
}

fn storage_from_row(row: &PgRow) -> Result<Storage, DatastoreError> {
    Ok(Storage {
        id: StorageId::from_uuid(column(row, "id")?),
        owner_id: OwnerId::from_uuid(column(row, "owner_id")?),
        name: column(row, "name")?,
        status: parse_column(row, "status")?,
        last_used: column(row, "last_used")?,
        create_time: column(row, "create_time")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task, DatastoreError> {
    Ok(Task {
        task_type: parse_column(row, "task_type")?,
        kind: parse_column(row, "kind")?,
        params: column(row, "params")?,
    })
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, DatastoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| DatastoreError::Corrupt(format!("column {name}: {e}")))
}

fn parse_column<T>(row: &PgRow, name: &str) -> Result<T, DatastoreError>
where
    T: core::str::FromStr<Err = geotill_core::DomainError>,
{
    let raw: String = column(row, name)?;
    raw.parse()
        .map_err(|e| DatastoreError::Corrupt(format!("column {name}: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DatastoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            DatastoreError::AlreadyExists {
                entity: "row",
                id: format!("{operation}: {}", db.message()),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            DatastoreError::Corrupt(format!("{operation}: {err}"))
        }
        _ => DatastoreError::Backend(format!("{operation}: {err}")),
    }
}
