//! Infrastructure layer: datastore, object store, queue transports, the job
//! worker and the janitor.

pub mod config;
pub mod datastore;
pub mod janitor;
pub mod message_queue;
pub mod objectstore;
pub mod submit;
pub mod task_runner;
pub mod volume;
pub mod worker;
pub mod workspace;

#[cfg(test)]
mod integration_tests;

pub use config::{Config, ConfigError, Mode};
pub use datastore::{Datastore, DatastoreError, InMemoryDatastore, PostgresDatastore};
pub use janitor::{Janitor, JanitorConfig, JanitorHandle, SweepReport};
pub use objectstore::{FilesystemObjectStore, InMemoryObjectStore, Object, ObjectStore, ObjectStoreError};
pub use submit::{JobSubmitter, SubmitError};
pub use task_runner::{ProcessTaskRunner, TaskError, TaskInvocation, TaskRunner};
pub use volume::{InputPolicy, Volume, VolumeError};
pub use worker::{Outcome, Worker, WorkerConfig, WorkerError, WorkerHandle, WorkerLoop, WorkerLoopConfig};
