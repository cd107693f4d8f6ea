//! Execution of the external task binaries.
//!
//! A task is invoked as `<command> <input file> <output dir> <args...>`. It
//! succeeds only if it exits 0 and writes nothing to stderr.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use geotill_core::JobId;

/// One run of a task binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInvocation {
    pub job_id: JobId,
    pub command: String,
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The task ran and reported failure; the message is what the job records.
    #[error("{0}")]
    Failed(String),
}

pub trait TaskRunner: Send + Sync {
    fn run(&self, invocation: &TaskInvocation) -> Result<(), TaskError>;
}

impl<R> TaskRunner for Arc<R>
where
    R: TaskRunner + ?Sized,
{
    fn run(&self, invocation: &TaskInvocation) -> Result<(), TaskError> {
        (**self).run(invocation)
    }
}

/// Runs tasks as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessTaskRunner {
    bin_dir: Option<PathBuf>,
    clear_env: bool,
}

impl ProcessTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve commands inside `dir` instead of through `PATH`.
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    /// Start tasks with an empty environment.
    pub fn with_clear_env(mut self, clear_env: bool) -> Self {
        self.clear_env = clear_env;
        self
    }

    fn program(&self, command: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(command),
            None => PathBuf::from(command),
        }
    }
}

impl TaskRunner for ProcessTaskRunner {
    fn run(&self, invocation: &TaskInvocation) -> Result<(), TaskError> {
        let program = self.program(&invocation.command);

        let mut command = Command::new(&program);
        command
            .arg(&invocation.input)
            .arg(&invocation.output_dir)
            .args(&invocation.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        if self.clear_env {
            command.env_clear();
        }

        info!(
            job_id = %invocation.job_id,
            program = %program.display(),
            args = ?invocation.args,
            "running task"
        );
        let output = command.output().map_err(|source| TaskError::Spawn {
            command: program.display().to_string(),
            source,
        })?;

        debug!(job_id = %invocation.job_id, status = %output.status, "task exited");

        // Any stderr output at all is a failure, even whitespace.
        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match stderr.trim() {
                "" => format!("task {} wrote to stderr", invocation.command),
                text => text.to_string(),
            };
            return Err(TaskError::Failed(message));
        }
        if !output.status.success() {
            return Err(TaskError::Failed(format!(
                "task {} failed: {}",
                invocation.command, output.status
            )));
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;

    // Writing an executable while another test forks can fail with ETXTBSY.
    static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    fn script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn invocation(dir: &Path, command: &str, args: &[&str]) -> TaskInvocation {
        TaskInvocation {
            job_id: JobId::new(),
            command: command.to_string(),
            input: dir.join("input.geojson"),
            output_dir: dir.join("out"),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn passes_input_output_and_args() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        fs::create_dir_all(work.path().join("out")).unwrap();
        script(bin.path(), "buffer", r#"echo "$1|$3|$4" > "$2/result.txt""#);

        let runner = ProcessTaskRunner::new().with_bin_dir(bin.path()).with_clear_env(true);
        runner.run(&invocation(work.path(), "buffer", &["10", "8"])).unwrap();

        let written = fs::read_to_string(work.path().join("out/result.txt")).unwrap();
        let expected = format!("{}|10|8\n", work.path().join("input.geojson").display());
        assert_eq!(written, expected);
    }

    #[test]
    fn stderr_output_fails_even_with_zero_exit() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let bin = tempfile::tempdir().unwrap();
        script(bin.path(), "reproject", "echo 'unknown projection' >&2\nexit 0");

        let runner = ProcessTaskRunner::new().with_bin_dir(bin.path());
        let err = runner.run(&invocation(bin.path(), "reproject", &["bogus"])).unwrap_err();
        assert_eq!(err.to_string(), "unknown projection");
    }

    #[test]
    fn whitespace_only_stderr_still_fails() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let bin = tempfile::tempdir().unwrap();
        script(bin.path(), "buffer", "printf '\\n  \\n' >&2\nexit 0");

        let runner = ProcessTaskRunner::new().with_bin_dir(bin.path());
        let err = runner.run(&invocation(bin.path(), "buffer", &["5", "8"])).unwrap_err();
        assert_eq!(err.to_string(), "task buffer wrote to stderr");
    }

    #[test]
    fn non_zero_exit_fails() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let bin = tempfile::tempdir().unwrap();
        script(bin.path(), "filter", "exit 3");

        let runner = ProcessTaskRunner::new().with_bin_dir(bin.path());
        let err = runner.run(&invocation(bin.path(), "filter", &[])).unwrap_err();
        assert!(matches!(&err, TaskError::Failed(msg) if msg.starts_with("task filter failed")));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let bin = tempfile::tempdir().unwrap();
        let runner = ProcessTaskRunner::new().with_bin_dir(bin.path());
        let err = runner.run(&invocation(bin.path(), "vectorlookup", &[])).unwrap_err();
        assert!(matches!(err, TaskError::Spawn { .. }));
    }
}
