//! Filesystem staging area for one job's input or output payload.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("no input found")]
    Empty,

    #[error("ambiguous input: {first} and {second} (and possibly more)")]
    Ambiguous { first: PathBuf, second: PathBuf },
}

/// How the task input is picked out of a downloaded volume.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum InputPolicy {
    /// First file in traversal order; any others are ignored.
    #[default]
    FirstWins,
    /// Exactly one file must be present.
    Strict,
}

impl InputPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputPolicy::FirstWins => "first-wins",
            InputPolicy::Strict => "strict",
        }
    }
}

impl fmt::Display for InputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-wins" | "first_wins" => Ok(InputPolicy::FirstWins),
            "strict" => Ok(InputPolicy::Strict),
            other => Err(format!("unknown input policy: {other}")),
        }
    }
}

/// A regular file inside a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFile {
    /// Absolute (or workdir-rooted) path on disk.
    pub path: PathBuf,
    /// Path relative to the volume root.
    pub relative: PathBuf,
}

/// A directory owned by one job invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    path: PathBuf,
}

impl Volume {
    /// Ensure `path` exists as a directory. Idempotent.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, VolumeError> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Wrap an existing directory without creating anything.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, VolumeError> {
        let path = path.into();
        if !std::fs::metadata(&path)?.is_dir() {
            return Err(VolumeError::Io(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", path.display()),
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Files under the volume, sorted by file name at every level.
    ///
    /// Lazy: nothing is read past what the caller consumes. Each call starts
    /// a fresh traversal.
    pub fn walk(&self) -> impl Iterator<Item = Result<VolumeFile, VolumeError>> + '_ {
        WalkDir::new(&self.path)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    let relative = entry
                        .path()
                        .strip_prefix(&self.path)
                        .unwrap_or(entry.path())
                        .to_path_buf();
                    Some(Ok(VolumeFile {
                        path: entry.into_path(),
                        relative,
                    }))
                }
                Ok(_) => None,
                Err(e) => Some(Err(VolumeError::from(e))),
            })
    }

    /// Pick the task input according to `policy`.
    pub fn select_input(&self, policy: InputPolicy) -> Result<PathBuf, VolumeError> {
        let mut files = self.walk();
        let first = files.next().transpose()?.ok_or(VolumeError::Empty)?;

        if policy == InputPolicy::Strict {
            if let Some(second) = files.next().transpose()? {
                return Err(VolumeError::Ambiguous {
                    first: first.relative,
                    second: second.relative,
                });
            }
        }
        Ok(first.path)
    }
}
