//! Process configuration loaded from `GEOTILL_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::janitor::JanitorConfig;
use crate::volume::InputPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which background loops the daemon runs.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Mode {
    Worker,
    Janitor,
    #[default]
    All,
}

impl Mode {
    pub fn runs_worker(&self) -> bool {
        matches!(self, Mode::Worker | Mode::All)
    }

    pub fn runs_janitor(&self) -> bool {
        matches!(self, Mode::Janitor | Mode::All)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Mode::Worker),
            "janitor" => Ok(Mode::Janitor),
            "all" => Ok(Mode::All),
            other => Err(format!("expected worker, janitor or all, got {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    /// Extra connection attempts at startup.
    pub retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub url: String,
    pub stream: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    /// Directory holding the task binaries; `PATH` lookup when unset.
    pub bin_dir: Option<PathBuf>,
    pub clear_env: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub worker_name: String,
    pub workdir: PathBuf,
    pub objectstore_root: PathBuf,
    pub input_policy: InputPolicy,
    pub database: DatabaseConfig,
    /// Present exactly when the mode runs a worker.
    pub queue: Option<QueueConfig>,
    pub task: TaskConfig,
    pub janitor: JanitorConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let workdir = get("GEOTILL_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("geotill"));
        let objectstore_root = get("GEOTILL_OBJECTSTORE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| workdir.join("objects"));

        let defaults = JanitorConfig::default();
        let mode = parse_or(&get, "GEOTILL_MODE", Mode::default())?;

        let queue = if mode.runs_worker() {
            Some(QueueConfig {
                url: required("GEOTILL_QUEUE_URL")?,
                stream: get("GEOTILL_QUEUE_STREAM").unwrap_or_else(|| "geotill:jobs".to_string()),
                group: get("GEOTILL_QUEUE_GROUP").unwrap_or_else(|| "geotill-workers".to_string()),
            })
        } else {
            None
        };

        Ok(Self {
            mode,
            worker_name: get("GEOTILL_WORKER_NAME").unwrap_or_else(|| "geotill-worker".to_string()),
            input_policy: parse_or(&get, "GEOTILL_INPUT_POLICY", InputPolicy::default())?,
            database: DatabaseConfig {
                url: required("GEOTILL_DATABASE_URL")?,
                retries: parse_or(&get, "GEOTILL_DATABASE_RETRIES", 5)?,
                retry_delay: Duration::from_secs(parse_or(&get, "GEOTILL_DATABASE_RETRY_DELAY_SECS", 5)?),
            },
            queue,
            task: TaskConfig {
                bin_dir: get("GEOTILL_TASK_BIN_DIR").map(PathBuf::from),
                clear_env: parse_or(&get, "GEOTILL_TASK_CLEAR_ENV", true)?,
            },
            janitor: JanitorConfig {
                retention: Duration::from_secs(parse_or(
                    &get,
                    "GEOTILL_JANITOR_RETENTION_SECS",
                    defaults.retention.as_secs(),
                )?),
                interval: Duration::from_secs(parse_or(
                    &get,
                    "GEOTILL_JANITOR_INTERVAL_SECS",
                    defaults.interval.as_secs(),
                )?),
            },
            workdir,
            objectstore_root,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
