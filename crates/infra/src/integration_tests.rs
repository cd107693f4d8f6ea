//! Integration tests for the job pipeline.
//!
//! Tests: Submitter → Queue → Worker → Datastore / ObjectStore → Janitor
//!
//! Verifies:
//! - Every handled job ends `Complete` (with a `Ready` output) or `Error`
//!   (with a message), and its working directory is gone
//! - Redelivered messages never re-run a task
//! - Expired jobs and storage are reclaimed, a failed blob delete keeps the
//!   storage row, and one failed delete never stops the sweep

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use geotill_core::{Job, JobId, JobStatus, OwnerId, Storage, StorageId, StorageStatus, Task, TaskType};
use geotill_queue::{InMemoryQueue, JobMessage, MessageQueue};

use crate::datastore::{Datastore, DatastoreError, InMemoryDatastore};
use crate::janitor::{Janitor, JanitorConfig, SweepReport};
use crate::objectstore::in_memory::InMemoryObject;
use crate::objectstore::{InMemoryObjectStore, ObjectStore, ObjectStoreError};
use crate::submit::JobSubmitter;
use crate::task_runner::{TaskError, TaskInvocation, TaskRunner};
use crate::volume::{InputPolicy, Volume};
use crate::worker::{Outcome, Worker, WorkerConfig, WorkerError, WorkerLoop, WorkerLoopConfig};
use crate::workspace::job_dir;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Behaviour {
    /// Write these files into the output directory and succeed.
    Write(Vec<(&'static str, &'static str)>),
    /// Report failure with this message (as a task writing to stderr would).
    Fail(&'static str),
    Panic,
}

#[derive(Debug)]
struct FakeRunner {
    behaviour: Mutex<Behaviour>,
    calls: Mutex<Vec<(TaskInvocation, bool)>>,
}

impl FakeRunner {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Mutex::new(behaviour),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn last_call(&self) -> (TaskInvocation, bool) {
        self.calls.lock().unwrap().last().cloned().unwrap()
    }
}

impl TaskRunner for FakeRunner {
    fn run(&self, invocation: &TaskInvocation) -> Result<(), TaskError> {
        let input_present = invocation.input.is_file();
        self.calls
            .lock()
            .unwrap()
            .push((invocation.clone(), input_present));

        let behaviour = self.behaviour.lock().unwrap().clone();
        match behaviour {
            Behaviour::Write(files) => {
                for (name, contents) in files {
                    std::fs::write(invocation.output_dir.join(name), contents).unwrap();
                }
                Ok(())
            }
            Behaviour::Fail(msg) => Err(TaskError::Failed(msg.to_string())),
            Behaviour::Panic => panic!("segfault in geometry library"),
        }
    }
}

/// Datastore wrapper with injectable faults.
#[derive(Debug, Default)]
struct FaultyDatastore {
    inner: InMemoryDatastore,
    /// `get_job` reports `Pending` regardless of the stored status.
    stale_reads: AtomicBool,
    fail_update_job: AtomicBool,
    fail_delete_job: Mutex<HashSet<JobId>>,
    /// Reject updates that would mark storage `Ready`.
    fail_ready_update: AtomicBool,
}

impl Datastore for FaultyDatastore {
    fn create_job(&self, job: &Job) -> Result<Job, DatastoreError> {
        self.inner.create_job(job)
    }

    fn get_job(&self, id: JobId) -> Result<Job, DatastoreError> {
        let mut job = self.inner.get_job(id)?;
        if self.stale_reads.load(Ordering::SeqCst) {
            job.status = JobStatus::Pending;
        }
        Ok(job)
    }

    fn update_job(&self, job: &Job) -> Result<Job, DatastoreError> {
        if self.fail_update_job.load(Ordering::SeqCst) {
            return Err(DatastoreError::Backend("connection reset".to_string()));
        }
        self.inner.update_job(job)
    }

    fn claim_job(&self, id: JobId, at: DateTime<Utc>) -> Result<Option<Job>, DatastoreError> {
        self.inner.claim_job(id, at)
    }

    fn get_jobs_before(&self, retention: Duration) -> Result<Vec<Job>, DatastoreError> {
        self.inner.get_jobs_before(retention)
    }

    fn delete_job(&self, id: JobId) -> Result<(), DatastoreError> {
        if self.fail_delete_job.lock().unwrap().contains(&id) {
            return Err(DatastoreError::Backend("statement timeout".to_string()));
        }
        self.inner.delete_job(id)
    }

    fn create_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError> {
        self.inner.create_storage(storage)
    }

    fn get_storage(&self, id: StorageId) -> Result<Storage, DatastoreError> {
        self.inner.get_storage(id)
    }

    fn update_storage(&self, storage: &Storage) -> Result<Storage, DatastoreError> {
        if storage.status == StorageStatus::Ready && self.fail_ready_update.load(Ordering::SeqCst) {
            return Err(DatastoreError::Backend("deadlock detected".to_string()));
        }
        self.inner.update_storage(storage)
    }

    fn touch_storage(&self, id: StorageId) -> Result<Storage, DatastoreError> {
        self.inner.touch_storage(id)
    }

    fn get_storage_before(&self, retention: Duration) -> Result<Vec<Storage>, DatastoreError> {
        self.inner.get_storage_before(retention)
    }

    fn delete_storage(&self, id: StorageId) -> Result<(), DatastoreError> {
        self.inner.delete_storage(id)
    }

    fn get_task(&self, task_type: TaskType) -> Result<Task, DatastoreError> {
        self.inner.get_task(task_type)
    }

    fn get_task_by_job_id(&self, id: JobId) -> Result<Task, DatastoreError> {
        self.inner.get_task_by_job_id(id)
    }
}

/// Object store wrapper with injectable faults.
#[derive(Debug, Default)]
struct FaultyObjectStore {
    inner: InMemoryObjectStore,
    fail_put: AtomicBool,
    fail_delete: Mutex<HashSet<StorageId>>,
    put_attempts: Mutex<Vec<StorageId>>,
}

impl ObjectStore for FaultyObjectStore {
    type Object = InMemoryObject;

    fn get_object(&self, id: StorageId) -> Result<InMemoryObject, ObjectStoreError> {
        self.inner.get_object(id)
    }

    fn put_object(&self, id: StorageId, volume: &Volume) -> Result<(), ObjectStoreError> {
        self.put_attempts.lock().unwrap().push(id);
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend("bucket unavailable".to_string()));
        }
        self.inner.put_object(id, volume)
    }

    fn delete_object(&self, id: StorageId) -> Result<(), ObjectStoreError> {
        if self.fail_delete.lock().unwrap().contains(&id) {
            return Err(ObjectStoreError::Backend("access denied".to_string()));
        }
        self.inner.delete_object(id)
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

type TestWorker = Worker<Arc<FaultyDatastore>, Arc<FaultyObjectStore>, Arc<FakeRunner>>;

struct Fixture {
    ds: Arc<FaultyDatastore>,
    os: Arc<FaultyObjectStore>,
    runner: Arc<FakeRunner>,
    workdir: tempfile::TempDir,
    owner: OwnerId,
}

impl Fixture {
    fn new() -> Self {
        Self {
            ds: Arc::new(FaultyDatastore {
                inner: InMemoryDatastore::with_builtin_tasks(),
                ..Default::default()
            }),
            os: Arc::new(FaultyObjectStore::default()),
            runner: FakeRunner::new(Behaviour::Write(vec![("result.geojson", "{\"type\":\"FeatureCollection\"}")])),
            workdir: tempfile::tempdir().unwrap(),
            owner: OwnerId::new(),
        }
    }

    fn worker(&self) -> TestWorker {
        self.worker_with(WorkerConfig::new(self.workdir.path()))
    }

    fn worker_with(&self, config: WorkerConfig) -> TestWorker {
        Worker::new(self.ds.clone(), self.os.clone(), self.runner.clone(), config).unwrap()
    }

    /// A client upload: storage row plus blob.
    fn upload(&self, files: &[(&str, &str)]) -> Storage {
        let storage = self
            .ds
            .create_storage(&Storage::new(self.owner, Some("parcels".into()), StorageStatus::Unknown))
            .unwrap();
        self.os
            .inner
            .insert(storage.id, files.iter().map(|(p, c)| (*p, *c)))
            .unwrap();
        storage
    }

    fn pending_job(&self, task_type: TaskType, args: &[&str], input: StorageId) -> Job {
        let job = Job::new(
            self.owner,
            task_type,
            args.iter().map(|a| a.to_string()).collect(),
            input,
        );
        self.ds.create_job(&job).unwrap()
    }

    fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

fn message(job: &Job) -> JobMessage {
    JobMessage::new(job.id)
}

/// Terminal-state invariants every handled job must satisfy.
fn assert_finalized(ds: &impl Datastore, id: JobId) -> Job {
    let job = ds.get_job(id).unwrap();
    assert!(job.status.is_terminal(), "job left in {}", job.status);
    assert!(job.start_time.is_some());
    assert!(job.end_time.is_some());
    match job.status {
        JobStatus::Complete => {
            assert!(job.error.is_none());
            let output = job.output_id.expect("complete job without output");
            assert_eq!(ds.get_storage(output).unwrap().status, StorageStatus::Ready);
        }
        JobStatus::Error => {
            assert!(job.error.as_deref().is_some_and(|e| !e.is_empty()));
            assert!(job.output_id.is_none());
        }
        _ => unreachable!(),
    }
    job
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[test]
fn successful_task_completes_job_and_uploads_output() {
    let fx = Fixture::new();
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let job = fx.pending_job(TaskType::Buffer, &["25", "8"], input.id);

    let outcome = fx.worker().handle(&message(&job)).unwrap();

    let Outcome::Completed { output_id } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    let stored = assert_finalized(&*fx.ds, job.id);
    assert_eq!(stored.output_id, Some(output_id));

    let output = fx.ds.get_storage(output_id).unwrap();
    assert_eq!(output.owner_id, fx.owner);
    let blob = fx.os.inner.files(output_id).unwrap();
    assert!(blob.contains_key(Path::new("result.geojson")));

    let (invocation, input_present) = fx.runner.last_call();
    assert!(input_present);
    assert_eq!(invocation.command, "buffer");
    assert_eq!(invocation.args, vec!["25", "8"]);
    assert!(invocation.input.ends_with("input/parcels.geojson"));
    assert!(invocation.output_dir.ends_with("output"));
}

#[test]
fn stderr_output_fails_job_without_output_storage() {
    let fx = Fixture::new();
    fx.runner.set(Behaviour::Fail("invalid geometry"));
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let job = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);
    let storage_before = fx.ds.inner.storage_count();

    let outcome = fx.worker().handle(&message(&job)).unwrap();

    assert_eq!(
        outcome,
        Outcome::Failed {
            error: "invalid geometry".to_string()
        }
    );
    let stored = assert_finalized(&*fx.ds, job.id);
    assert_eq!(stored.error.as_deref(), Some("invalid geometry"));
    assert_eq!(fx.ds.inner.storage_count(), storage_before);
}

#[test]
fn empty_input_fails_without_running_task() {
    let fx = Fixture::new();
    let input = fx.upload(&[]);
    let job = fx.pending_job(TaskType::Reproject, &["EPSG:3857"], input.id);

    fx.worker().handle(&message(&job)).unwrap();

    let stored = assert_finalized(&*fx.ds, job.id);
    assert_eq!(stored.status, JobStatus::Error);
    assert!(stored.error.unwrap().contains("no input found"));
    assert_eq!(fx.runner.call_count(), 0);
}

#[test]
fn missing_input_blob_fails_job() {
    let fx = Fixture::new();
    let input = fx.upload(&[("a.shp", "x")]);
    fx.os.inner.delete_object(input.id).unwrap();
    let job = fx.pending_job(TaskType::Reproject, &["EPSG:3857"], input.id);

    fx.worker().handle(&message(&job)).unwrap();

    let stored = assert_finalized(&*fx.ds, job.id);
    assert!(stored.error.unwrap().contains("not found"));
    assert_eq!(fx.runner.call_count(), 0);
}

#[test]
fn finished_and_running_jobs_are_not_touched() {
    let fx = Fixture::new();
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let worker = fx.worker();

    let done = fx.pending_job(TaskType::Reproject, &["EPSG:4326"], input.id);
    worker.handle(&message(&done)).unwrap();
    let done_before = fx.ds.get_job(done.id).unwrap();
    let storage_before = fx.ds.inner.storage_count();
    let calls_before = fx.runner.call_count();

    let running = fx.pending_job(TaskType::Reproject, &["EPSG:4326"], input.id);
    fx.ds.claim_job(running.id, Utc::now()).unwrap();

    assert_eq!(worker.handle(&message(&done)).unwrap(), Outcome::AlreadyHandled);
    assert_eq!(worker.handle(&message(&running)).unwrap(), Outcome::AlreadyHandled);

    assert_eq!(fx.ds.get_job(done.id).unwrap(), done_before);
    assert_eq!(fx.ds.get_job(running.id).unwrap().status, JobStatus::InProgress);
    assert_eq!(fx.ds.inner.storage_count(), storage_before);
    assert_eq!(fx.runner.call_count(), calls_before);
}

#[test]
fn redelivered_error_job_is_not_rerun() {
    let fx = Fixture::new();
    fx.runner.set(Behaviour::Fail("boom"));
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let job = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);
    let worker = fx.worker();

    worker.handle(&message(&job)).unwrap();
    fx.runner.set(Behaviour::Write(vec![]));
    assert_eq!(worker.handle(&message(&job)).unwrap(), Outcome::AlreadyHandled);

    assert_eq!(fx.runner.call_count(), 1);
    assert_eq!(fx.ds.get_job(job.id).unwrap().status, JobStatus::Error);
}

#[test]
fn lost_claim_race_is_a_no_op() {
    let fx = Fixture::new();
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let job = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);

    // Another worker claimed the job between our read and our claim.
    fx.ds.claim_job(job.id, Utc::now()).unwrap();
    fx.ds.stale_reads.store(true, Ordering::SeqCst);

    assert_eq!(fx.worker().handle(&message(&job)).unwrap(), Outcome::AlreadyHandled);
    assert_eq!(fx.runner.call_count(), 0);
    assert_eq!(fx.ds.inner.get_job(job.id).unwrap().status, JobStatus::InProgress);
}

#[test]
fn missing_job_is_not_found_and_changes_nothing() {
    let fx = Fixture::new();
    let err = fx.worker().handle(&JobMessage::new(JobId::new())).unwrap_err();
    assert!(matches!(err, WorkerError::NotFound(_)));
    assert_eq!(fx.ds.inner.job_count(), 0);
}

#[test]
fn working_directory_is_removed_on_every_path() {
    let fx = Fixture::new();
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let worker = fx.worker();

    for behaviour in [
        Behaviour::Write(vec![("out.geojson", "{}")]),
        Behaviour::Fail("bad projection"),
        Behaviour::Panic,
    ] {
        fx.runner.set(behaviour);
        let job = fx.pending_job(TaskType::Reproject, &["EPSG:3857"], input.id);
        worker.handle(&message(&job)).unwrap();

        assert_finalized(&*fx.ds, job.id);
        assert!(!job_dir(fx.workdir(), job.id).exists());
    }
}

#[test]
fn panicking_task_is_recorded_as_error() {
    let fx = Fixture::new();
    fx.runner.set(Behaviour::Panic);
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let job = fx.pending_job(TaskType::VectorLookup, &["13.4", "52.5"], input.id);

    let outcome = fx.worker().handle(&message(&job)).unwrap();

    assert!(matches!(outcome, Outcome::Failed { ref error } if error.contains("segfault in geometry library")));
    assert_finalized(&*fx.ds, job.id);
}

#[test]
fn unknown_task_fails_job() {
    let fx = Fixture::new();
    fx.ds.inner.remove_task(TaskType::RasterLookup).unwrap();
    let input = fx.upload(&[("dem.tif", "raster")]);
    let job = fx.pending_job(TaskType::RasterLookup, &["1", "13.4", "52.5"], input.id);

    fx.worker().handle(&message(&job)).unwrap();

    let stored = assert_finalized(&*fx.ds, job.id);
    assert_eq!(stored.error.as_deref(), Some("unknown task: rasterlookup"));
}

#[test]
fn strict_input_policy_rejects_multiple_files() {
    let fx = Fixture::new();
    let input = fx.upload(&[("a.geojson", "{}"), ("b.geojson", "{}")]);
    let job = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);

    let worker = fx.worker_with(WorkerConfig::new(fx.workdir()).with_input_policy(InputPolicy::Strict));
    worker.handle(&message(&job)).unwrap();

    let stored = assert_finalized(&*fx.ds, job.id);
    assert!(stored.error.unwrap().starts_with("ambiguous input"));
    assert_eq!(fx.runner.call_count(), 0);
}

#[test]
fn first_file_wins_by_default() {
    let fx = Fixture::new();
    let input = fx.upload(&[("b.geojson", "{}"), ("a.geojson", "{}")]);
    let job = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);

    fx.worker().handle(&message(&job)).unwrap();

    let (invocation, _) = fx.runner.last_call();
    assert!(invocation.input.ends_with("a.geojson"));
}

#[test]
fn failed_upload_marks_output_unusable() {
    let fx = Fixture::new();
    fx.os.fail_put.store(true, Ordering::SeqCst);
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let job = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);
    let storage_before = fx.ds.inner.storage_count();

    fx.worker().handle(&message(&job)).unwrap();

    let stored = assert_finalized(&*fx.ds, job.id);
    assert!(stored.error.unwrap().contains("bucket unavailable"));

    // The output row exists but can never feed another job.
    assert_eq!(fx.ds.inner.storage_count(), storage_before + 1);
    let attempted = fx.os.put_attempts.lock().unwrap().clone();
    assert_eq!(attempted.len(), 1);
    let output = fx.ds.get_storage(attempted[0]).unwrap();
    assert_eq!(output.status, StorageStatus::Unusable);
    assert!(!fx.os.inner.contains(output.id));
}

#[test]
fn failed_ready_update_marks_output_unusable() {
    let fx = Fixture::new();
    fx.ds.fail_ready_update.store(true, Ordering::SeqCst);
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let job = fx.pending_job(TaskType::Buffer, &["25", "8"], input.id);

    let outcome = fx.worker().handle(&message(&job)).unwrap();

    assert!(matches!(outcome, Outcome::Failed { ref error } if error.contains("deadlock detected")));
    assert_finalized(&*fx.ds, job.id);

    let attempted = fx.os.put_attempts.lock().unwrap().clone();
    assert_eq!(attempted.len(), 1);
    let output = fx.ds.get_storage(attempted[0]).unwrap();
    assert_eq!(output.status, StorageStatus::Unusable);
}

#[test]
fn failed_final_persist_is_returned_to_caller() {
    let fx = Fixture::new();
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let job = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);
    fx.ds.fail_update_job.store(true, Ordering::SeqCst);

    let err = fx.worker().handle(&message(&job)).unwrap_err();

    assert!(matches!(err, WorkerError::Upstream(_)));
    assert_eq!(fx.ds.get_job(job.id).unwrap().status, JobStatus::InProgress);
    assert!(!job_dir(fx.workdir(), job.id).exists());
}

#[test]
fn input_storage_is_touched() {
    let fx = Fixture::new();
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let stale = Utc::now() - ChronoDuration::days(2);
    fx.ds.inner.set_storage_last_used(input.id, stale).unwrap();
    let job = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);

    let worker = fx.worker();
    worker.handle(&message(&job)).unwrap();
    worker.flush_touches();

    assert!(fx.ds.get_storage(input.id).unwrap().last_used > stale);
}

// ---------------------------------------------------------------------------
// Submission + worker loop
// ---------------------------------------------------------------------------

#[test]
fn submitted_job_is_processed_and_acked_by_worker_loop() {
    let fx = Fixture::new();
    let queue = Arc::new(InMemoryQueue::new());
    let submitter = JobSubmitter::new(fx.ds.clone(), queue.clone());
    let input = fx.upload(&[("parcels.geojson", "{}")]);

    let job = submitter
        .submit(fx.owner, TaskType::Filter, vec!["landuse".into(), "forest".into()], input.id)
        .unwrap();

    let handle = WorkerLoop::spawn(
        fx.worker(),
        queue.clone(),
        WorkerLoopConfig::default()
            .with_name("worker-test")
            .with_receive_timeout(Duration::from_millis(20)),
    )
    .unwrap();

    let completed = wait_until(Duration::from_secs(5), || {
        handle.stats().jobs_completed == 1 && queue.in_flight_len() == 0
    });
    let stats = handle.stats();
    handle.shutdown();

    assert!(completed, "worker loop did not complete the job: {stats:?}");
    assert_finalized(&*fx.ds, job.id);
    assert_eq!(queue.ready_len(), 0);
    assert_eq!(queue.in_flight_len(), 0);
}

#[test]
fn failing_message_is_nacked_until_dead_lettered() {
    let fx = Fixture::new();
    let queue = Arc::new(InMemoryQueue::with_max_deliveries(2));
    let orphan = JobMessage::new(JobId::new());
    queue.send(orphan).unwrap();

    let handle = WorkerLoop::spawn(
        fx.worker(),
        queue.clone(),
        WorkerLoopConfig::default().with_receive_timeout(Duration::from_millis(20)),
    )
    .unwrap();

    let dead = wait_until(Duration::from_secs(5), || queue.dead_letters().len() == 1);
    let stats = handle.stats();
    handle.shutdown();

    assert!(dead);
    assert_eq!(queue.dead_letters(), vec![orphan]);
    assert_eq!(stats.messages_nacked, 2);
}

// ---------------------------------------------------------------------------
// Janitor
// ---------------------------------------------------------------------------

fn janitor(fx: &Fixture) -> Janitor<Arc<FaultyDatastore>, Arc<FaultyObjectStore>> {
    Janitor::new(
        fx.ds.clone(),
        fx.os.clone(),
        JanitorConfig {
            retention: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(60),
        },
    )
}

#[test]
fn janitor_deletes_jobs_past_retention_only() {
    let fx = Fixture::new();
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let expired = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);
    let retained = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);
    fx.ds
        .inner
        .set_job_end_time(expired.id, Utc::now() - ChronoDuration::hours(25))
        .unwrap();
    fx.ds
        .inner
        .set_job_end_time(retained.id, Utc::now() - ChronoDuration::hours(23))
        .unwrap();

    let report = janitor(&fx).sweep();

    assert_eq!(report.jobs_deleted, 1);
    assert!(fx.ds.get_job(expired.id).unwrap_err().is_not_found());
    assert!(fx.ds.get_job(retained.id).is_ok());
    // Job deletion does not cascade to storage.
    assert!(fx.ds.get_storage(input.id).is_ok());
}

#[test]
fn janitor_continues_past_a_failed_job_delete() {
    let fx = Fixture::new();
    let input = fx.upload(&[("parcels.geojson", "{}")]);
    let stuck = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);
    let next = fx.pending_job(TaskType::RemoveBadGeometry, &[], input.id);
    fx.ds
        .inner
        .set_job_end_time(stuck.id, Utc::now() - ChronoDuration::hours(30))
        .unwrap();
    fx.ds
        .inner
        .set_job_end_time(next.id, Utc::now() - ChronoDuration::hours(26))
        .unwrap();
    fx.ds.fail_delete_job.lock().unwrap().insert(stuck.id);

    let report = janitor(&fx).sweep();

    assert_eq!(report.jobs_deleted, 1);
    assert_eq!(report.failures, 1);
    assert!(fx.ds.get_job(stuck.id).is_ok());
    assert!(fx.ds.get_job(next.id).unwrap_err().is_not_found());

    fx.ds.fail_delete_job.lock().unwrap().clear();
    assert_eq!(janitor(&fx).sweep().jobs_deleted, 1);
    assert!(fx.ds.get_job(stuck.id).unwrap_err().is_not_found());
}

#[test]
fn janitor_keeps_row_when_blob_delete_fails_and_continues() {
    let fx = Fixture::new();
    let stuck = fx.upload(&[("a.geojson", "{}")]);
    let gone = fx.upload(&[("b.geojson", "{}")]);
    for s in [&stuck, &gone] {
        fx.ds
            .inner
            .set_storage_last_used(s.id, Utc::now() - ChronoDuration::hours(48))
            .unwrap();
    }
    fx.os.fail_delete.lock().unwrap().insert(stuck.id);

    let report = janitor(&fx).sweep();

    assert_eq!(
        report,
        SweepReport {
            jobs_deleted: 0,
            storage_deleted: 1,
            failures: 1
        }
    );
    assert!(fx.ds.get_storage(stuck.id).is_ok());
    assert!(fx.os.inner.contains(stuck.id));
    assert!(fx.ds.get_storage(gone.id).unwrap_err().is_not_found());
    assert!(!fx.os.inner.contains(gone.id));

    // Retried on the next sweep once the store recovers.
    fx.os.fail_delete.lock().unwrap().clear();
    assert_eq!(janitor(&fx).sweep().storage_deleted, 1);
    assert!(fx.ds.get_storage(stuck.id).unwrap_err().is_not_found());
}
