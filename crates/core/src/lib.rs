//! `geotill-core`: job, storage and task model.
//!
//! This crate contains **pure domain** types and status transitions (no IO).
//! Datastores, object stores, queues and the worker live in `geotill-infra`.

pub mod error;
pub mod id;
pub mod job;
pub mod storage;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, OwnerId, StorageId};
pub use job::{Job, JobStatus};
pub use storage::{Storage, StorageStatus};
pub use task::{Task, TaskKind, TaskType};
