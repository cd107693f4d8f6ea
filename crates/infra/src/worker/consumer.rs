//! Queue consumer loop around a [`Worker`].

use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use geotill_queue::{Delivery, MessageQueue};

use super::{Outcome, Worker};
use crate::datastore::Datastore;
use crate::objectstore::ObjectStore;
use crate::task_runner::TaskRunner;

#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    /// Thread name, also used as the `worker` log field.
    pub name: String,
    /// Longest single wait on the queue; bounds shutdown latency.
    pub receive_timeout: Duration,
    /// Pause after a queue error before polling again.
    pub error_backoff: Duration,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            name: "geotill-worker".to_string(),
            receive_timeout: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerLoopConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }
}

/// Worker loop counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub messages_received: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub messages_skipped: u64,
    /// Deliveries handed back to the queue.
    pub messages_nacked: u64,
    pub uptime_secs: u64,
}

/// Handle to control and join a running worker loop.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the in-flight message to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Background consumer: receive, handle, settle.
///
/// - One message at a time, handled to completion
/// - `ack` after a successful handle, `nack` after an error
/// - Shutdown is observed between messages
#[derive(Debug)]
pub struct WorkerLoop;

impl WorkerLoop {
    pub fn spawn<Q, D, O, R>(
        worker: Worker<D, O, R>,
        queue: Q,
        config: WorkerLoopConfig,
    ) -> io::Result<WorkerHandle>
    where
        Q: MessageQueue + 'static,
        D: Datastore + Clone + 'static,
        O: ObjectStore + 'static,
        R: TaskRunner + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || consume(&worker, &queue, &config, shutdown_rx, &stats_clone))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn consume<Q, D, O, R>(
    worker: &Worker<D, O, R>,
    queue: &Q,
    config: &WorkerLoopConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<WorkerStats>,
) where
    Q: MessageQueue,
    D: Datastore + Clone + 'static,
    O: ObjectStore,
    R: TaskRunner,
{
    let started = Instant::now();
    info!(
        worker = %config.name,
        workdir = %worker.config().workdir.display(),
        input_policy = %worker.config().input_policy,
        "worker loop started"
    );

    loop {
        if !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty)) {
            break;
        }

        match queue.receive(config.receive_timeout) {
            Ok(Some(delivery)) => settle(worker, queue, config, &delivery, stats),
            Ok(None) => {}
            Err(e) => {
                warn!(worker = %config.name, error = %e, "queue receive failed");
                if shutdown_rx.recv_timeout(config.error_backoff).is_ok() {
                    break;
                }
            }
        }

        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = started.elapsed().as_secs();
        }
    }

    worker.flush_touches();
    info!(worker = %config.name, "worker loop stopped");
}

fn settle<Q, D, O, R>(
    worker: &Worker<D, O, R>,
    queue: &Q,
    config: &WorkerLoopConfig,
    delivery: &Delivery,
    stats: &Mutex<WorkerStats>,
) where
    Q: MessageQueue,
    D: Datastore + Clone + 'static,
    O: ObjectStore,
    R: TaskRunner,
{
    let job_id = delivery.message().id();
    debug!(worker = %config.name, job_id = %job_id, attempt = delivery.attempt(), "message received");

    let result = worker.handle(delivery.message());

    if let Ok(mut s) = stats.lock() {
        s.messages_received += 1;
        match &result {
            Ok(Outcome::Completed { .. }) => s.jobs_completed += 1,
            Ok(Outcome::Failed { .. }) => s.jobs_failed += 1,
            Ok(Outcome::AlreadyHandled) => s.messages_skipped += 1,
            Err(_) => s.messages_nacked += 1,
        }
    }

    match result {
        Ok(_) => {
            if let Err(e) = queue.ack(delivery) {
                warn!(worker = %config.name, job_id = %job_id, error = %e, "failed to ack message");
            }
        }
        Err(err) => {
            warn!(
                worker = %config.name,
                job_id = %job_id,
                attempt = delivery.attempt(),
                error = %err,
                "message handling failed; returning it to the queue"
            );
            if let Err(e) = queue.nack(delivery) {
                warn!(worker = %config.name, job_id = %job_id, error = %e, "failed to nack message");
            }
        }
    }
}
