//! Background `last_used` refresher for storage read by jobs.

use std::io;
use std::sync::mpsc;
use std::thread;

use tracing::{debug, warn};

use geotill_core::StorageId;

use crate::datastore::Datastore;

enum Command {
    Touch(StorageId),
    Flush(mpsc::Sender<()>),
}

/// Fire-and-forget storage touches.
///
/// Requests are queued on a channel and written by a dedicated thread, so a
/// slow or failing datastore never delays or fails a job. The thread exits once
/// the toucher is dropped and the queue is drained.
#[derive(Debug)]
pub struct StorageToucher {
    tx: mpsc::Sender<Command>,
}

impl StorageToucher {
    pub fn spawn<D>(datastore: D) -> io::Result<Self>
    where
        D: Datastore + 'static,
    {
        let (tx, rx) = mpsc::channel::<Command>();
        thread::Builder::new()
            .name("storage-toucher".to_string())
            .spawn(move || {
                for command in rx {
                    match command {
                        Command::Touch(id) => match datastore.touch_storage(id) {
                            Ok(_) => debug!(storage_id = %id, "storage touched"),
                            Err(e) => warn!(storage_id = %id, error = %e, "failed to touch storage"),
                        },
                        Command::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(Self { tx })
    }

    pub fn touch(&self, id: StorageId) {
        if self.tx.send(Command::Touch(id)).is_err() {
            warn!(storage_id = %id, "storage toucher stopped; touch dropped");
        }
    }

    /// Block until every touch queued before this call has been attempted.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Touch(id) => f.debug_tuple("Touch").field(id).finish(),
            Command::Flush(_) => f.write_str("Flush"),
        }
    }
}
