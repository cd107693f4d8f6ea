use anyhow::Context;
use tokio::runtime::Handle;

use geotill_infra::message_queue::RedisStreamsQueue;
use geotill_infra::{
    Config, FilesystemObjectStore, Janitor, JanitorHandle, PostgresDatastore, ProcessTaskRunner, Worker,
    WorkerConfig, WorkerHandle, WorkerLoop, WorkerLoopConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    geotill_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        mode = ?config.mode,
        worker = %config.worker_name,
        workdir = %config.workdir.display(),
        "starting geotill daemon"
    );

    let pool = PostgresDatastore::connect(
        &config.database.url,
        config.database.retries,
        config.database.retry_delay,
    )
    .await
    .context("failed to connect to postgres")?;
    let datastore = PostgresDatastore::new(pool, Handle::current());

    let object_store = std::sync::Arc::new(
        FilesystemObjectStore::new(&config.objectstore_root).context("failed to open object store")?,
    );

    let worker = if let Some(queue_config) = config.queue.clone() {
        let consumer = config.worker_name.clone();
        let queue = tokio::task::spawn_blocking(move || {
            RedisStreamsQueue::new(&queue_config.url, queue_config.stream, queue_config.group, consumer)
        })
        .await?
        .context("failed to connect to redis")?;

        let mut runner = ProcessTaskRunner::new().with_clear_env(config.task.clear_env);
        if let Some(dir) = &config.task.bin_dir {
            runner = runner.with_bin_dir(dir.clone());
        }

        let worker = Worker::new(
            datastore.clone(),
            object_store.clone(),
            runner,
            WorkerConfig::new(&config.workdir).with_input_policy(config.input_policy),
        )
        .context("failed to start worker")?;

        Some(
            WorkerLoop::spawn(
                worker,
                queue,
                WorkerLoopConfig::default().with_name(config.worker_name.clone()),
            )
            .context("failed to spawn worker loop")?,
        )
    } else {
        None
    };

    let janitor = if config.mode.runs_janitor() {
        Some(
            Janitor::new(datastore, object_store, config.janitor.clone())
                .spawn("geotill-janitor")
                .context("failed to spawn janitor")?,
        )
    } else {
        None
    };

    wait_for_shutdown(janitor.as_ref()).await?;
    tracing::info!("shutdown requested; waiting for the current job to finish");

    // Joining blocks until in-flight work completes.
    tokio::task::spawn_blocking(move || stop(worker, janitor)).await?;

    tracing::info!("geotill daemon stopped");
    Ok(())
}

fn stop(worker: Option<WorkerHandle>, janitor: Option<JanitorHandle>) {
    if let Some(handle) = worker {
        tracing::info!(stats = ?handle.stats(), "stopping worker loop");
        handle.shutdown();
    }
    if let Some(handle) = janitor {
        handle.shutdown();
    }
}

/// Block until ctrl-c or SIGTERM. SIGHUP requests an early janitor sweep.
#[cfg(unix)]
async fn wait_for_shutdown(janitor: Option<&JanitorHandle>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => return res.context("failed to listen for ctrl-c"),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => match janitor {
                Some(handle) => {
                    tracing::info!("SIGHUP received; triggering janitor sweep");
                    handle.trigger();
                }
                None => tracing::debug!("SIGHUP ignored; janitor not running"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_janitor: Option<&JanitorHandle>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")
}
