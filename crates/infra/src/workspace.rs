//! Per-job working directory: `<workdir>/jobs/<job id>/{input,output}`.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use geotill_core::JobId;

use crate::volume::{Volume, VolumeError};

/// Root of all job directories under a worker's workdir.
pub fn jobs_dir(workdir: &Path) -> PathBuf {
    workdir.join("jobs")
}

pub fn job_dir(workdir: &Path, job_id: JobId) -> PathBuf {
    jobs_dir(workdir).join(job_id.to_string())
}

/// Input and output volumes of one job invocation.
///
/// The whole job directory is removed when the workspace is dropped, on every
/// exit path of the invocation (including unwinding).
#[derive(Debug)]
pub struct JobWorkspace {
    job_id: JobId,
    dir: PathBuf,
    input: Volume,
    output: Volume,
}

impl JobWorkspace {
    pub fn create(workdir: &Path, job_id: JobId) -> Result<Self, VolumeError> {
        let dir = job_dir(workdir, job_id);
        // Leftovers from a crashed invocation of the same job.
        remove_dir(&dir)?;

        let workspace = Self {
            job_id,
            input: Volume::create(dir.join("input"))?,
            output: Volume::create(dir.join("output"))?,
            dir,
        };
        Ok(workspace)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input(&self) -> &Volume {
        &self.input
    }

    pub fn output(&self) -> &Volume {
        &self.output
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Err(e) = remove_dir(&self.dir) {
            warn!(job_id = %self.job_id, path = %self.dir.display(), error = %e, "failed to remove job directory");
        }
    }
}

fn remove_dir(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
