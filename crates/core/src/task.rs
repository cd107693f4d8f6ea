//! Task definitions (reference data, never mutated by the worker).

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Transformation a job runs.
///
/// The wire name (`as_str`) doubles as the name of the executable the worker
/// invokes for the task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Buffer,
    Filter,
    Reproject,
    RemoveBadGeometry,
    VectorLookup,
    RasterLookup,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::Buffer,
        TaskType::Filter,
        TaskType::Reproject,
        TaskType::RemoveBadGeometry,
        TaskType::VectorLookup,
        TaskType::RasterLookup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Buffer => "buffer",
            TaskType::Filter => "filter",
            TaskType::Reproject => "reproject",
            TaskType::RemoveBadGeometry => "removebadgeometry",
            TaskType::VectorLookup => "vectorlookup",
            TaskType::RasterLookup => "rasterlookup",
        }
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::unknown("task type", s))
    }
}

/// Broad category of a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Produces a transformed copy of the input dataset.
    Transformation,
    /// Produces values looked up from the input dataset.
    Lookup,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Transformation => "transformation",
            TaskKind::Lookup => "lookup",
        }
    }
}

impl FromStr for TaskKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transformation" => Ok(TaskKind::Transformation),
            "lookup" => Ok(TaskKind::Lookup),
            other => Err(DomainError::unknown("task kind", other)),
        }
    }
}

/// Definition of a transformation: which executable and which parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_type: TaskType,
    pub kind: TaskKind,
    /// Ordered parameter names; a job supplies one positional arg per name.
    pub params: Vec<String>,
}

impl Task {
    pub fn new(task_type: TaskType, kind: TaskKind, params: Vec<String>) -> Self {
        Self {
            task_type,
            kind,
            params,
        }
    }

    /// Stock definition for a task type, as seeded into a fresh datastore.
    pub fn builtin(task_type: TaskType) -> Self {
        let (kind, params): (TaskKind, &[&str]) = match task_type {
            TaskType::Buffer => (
                TaskKind::Transformation,
                &["buffer-distance", "quadrant-segment-count"],
            ),
            TaskType::Filter => (TaskKind::Transformation, &["filter-column", "filter-value"]),
            TaskType::Reproject => (TaskKind::Transformation, &["target-projection"]),
            TaskType::RemoveBadGeometry => (TaskKind::Transformation, &[]),
            TaskType::VectorLookup => (TaskKind::Lookup, &["longitude", "latitude"]),
            TaskType::RasterLookup => (TaskKind::Lookup, &["bands", "longitude", "latitude"]),
        };
        Self::new(task_type, kind, params.iter().map(|p| p.to_string()).collect())
    }

    /// Name of the executable to invoke.
    pub fn command(&self) -> &'static str {
        self.task_type.as_str()
    }

    /// Check a job's positional args against this task's parameter list.
    pub fn validate_args(&self, args: &[String]) -> DomainResult<()> {
        if args.len() != self.params.len() {
            return Err(DomainError::validation(format!(
                "task {} expects {} argument(s) ({}), got {}",
                self.task_type,
                self.params.len(),
                self.params.join(", "),
                args.len()
            )));
        }
        Ok(())
    }
}
