//! Expiry sweep for finished jobs and idle storage.

use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::datastore::Datastore;
use crate::objectstore::ObjectStore;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub jobs_deleted: usize,
    pub storage_deleted: usize,
    /// Listings or deletes that failed and will be retried on a later sweep.
    pub failures: usize,
}

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Age after which finished jobs and unused storage are deleted.
    pub retention: Duration,
    /// Time between sweeps.
    pub interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Deletes jobs whose `end_time` and storage whose `last_used` are older than
/// the retention window.
///
/// Storage blobs are deleted before their rows. A row whose blob could not be
/// deleted is kept so the blob stays reachable for the next sweep.
#[derive(Debug, Clone)]
pub struct Janitor<D, O> {
    datastore: D,
    object_store: O,
    config: JanitorConfig,
}

impl<D, O> Janitor<D, O>
where
    D: Datastore,
    O: ObjectStore,
{
    pub fn new(datastore: D, object_store: O, config: JanitorConfig) -> Self {
        Self {
            datastore,
            object_store,
            config,
        }
    }

    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_jobs(&mut report);
        self.sweep_storage(&mut report);

        info!(
            jobs_deleted = report.jobs_deleted,
            storage_deleted = report.storage_deleted,
            failures = report.failures,
            "janitor sweep finished"
        );
        report
    }

    fn sweep_jobs(&self, report: &mut SweepReport) {
        let jobs = match self.datastore.get_jobs_before(self.config.retention) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to list expired jobs");
                report.failures += 1;
                return;
            }
        };

        for job in jobs {
            match self.datastore.delete_job(job.id) {
                Ok(()) => {
                    debug!(job_id = %job.id, "expired job deleted");
                    report.jobs_deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to delete expired job");
                    report.failures += 1;
                }
            }
        }
    }

    fn sweep_storage(&self, report: &mut SweepReport) {
        let storage = match self.datastore.get_storage_before(self.config.retention) {
            Ok(storage) => storage,
            Err(e) => {
                warn!(error = %e, "failed to list expired storage");
                report.failures += 1;
                return;
            }
        };

        for s in storage {
            match self.object_store.delete_object(s.id) {
                Ok(()) => {}
                // Already gone; the row is all that is left.
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(storage_id = %s.id, error = %e, "failed to delete expired object; keeping row");
                    report.failures += 1;
                    continue;
                }
            }

            match self.datastore.delete_storage(s.id) {
                Ok(()) => {
                    debug!(storage_id = %s.id, "expired storage deleted");
                    report.storage_deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(storage_id = %s.id, error = %e, "failed to delete expired storage row");
                    report.failures += 1;
                }
            }
        }
    }
}

/// Handle to control and join a running janitor.
#[derive(Debug)]
pub struct JanitorHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl JanitorHandle {
    /// Request a sweep ahead of schedule. Coalesces with pending requests.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Request graceful shutdown and wait for the current sweep to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl<D, O> Janitor<D, O>
where
    D: Datastore + 'static,
    O: ObjectStore + 'static,
{
    /// Sweep on startup and then every `interval` on a background thread.
    pub fn spawn(self, name: &str) -> io::Result<JanitorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

        let thread_name = name.to_string();
        let janitor = self;
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || janitor_loop(&thread_name, &janitor, shutdown_rx, trigger_rx))?;

        Ok(JanitorHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
        })
    }
}

fn janitor_loop<D, O>(
    name: &str,
    janitor: &Janitor<D, O>,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
) where
    D: Datastore,
    O: ObjectStore,
{
    info!(janitor = name, interval_secs = janitor.config.interval.as_secs(), "janitor started");

    let poll = Duration::from_millis(250);
    let mut next_tick = Instant::now();

    loop {
        if !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty)) {
            break;
        }

        let mut pending = false;
        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            while next_tick <= now {
                next_tick += janitor.config.interval.max(poll);
            }
        }
        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if pending {
            janitor.sweep();
            continue;
        }

        let wait = next_tick.saturating_duration_since(Instant::now()).min(poll);
        match shutdown_rx.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    info!(janitor = name, "janitor stopped");
}
