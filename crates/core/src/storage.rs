//! Storage records: references to blobs plus their lifecycle metadata.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{OwnerId, StorageId};

/// Lifecycle status of a storage blob.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStatus {
    /// Uploaded by a client; contents not inspected.
    Unknown,
    /// Being written by a job.
    Processing,
    /// Written by a job and usable as another job's input.
    Ready,
    /// Frozen; may be read but never used as a job input.
    Final,
    /// Broken or partially written.
    Unusable,
}

impl StorageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStatus::Unknown => "unknown",
            StorageStatus::Processing => "processing",
            StorageStatus::Ready => "ready",
            StorageStatus::Final => "final",
            StorageStatus::Unusable => "unusable",
        }
    }

    pub fn accepts_jobs(&self) -> bool {
        !matches!(self, StorageStatus::Final | StorageStatus::Unusable)
    }
}

impl core::fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(StorageStatus::Unknown),
            "processing" => Ok(StorageStatus::Processing),
            "ready" => Ok(StorageStatus::Ready),
            "final" => Ok(StorageStatus::Final),
            "unusable" => Ok(StorageStatus::Unusable),
            other => Err(DomainError::unknown("storage status", other)),
        }
    }
}

/// A stored dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    pub id: StorageId,
    pub owner_id: OwnerId,
    pub name: Option<String>,
    pub status: StorageStatus,
    pub last_used: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
}

impl Storage {
    pub fn new(owner_id: OwnerId, name: Option<String>, status: StorageStatus) -> Self {
        let now = Utc::now();
        Self {
            id: StorageId::new(),
            owner_id,
            name,
            status,
            last_used: now,
            create_time: now,
        }
    }

    /// Refresh `last_used`. Never moves it backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_used {
            self.last_used = at;
        }
    }

    /// Reject storage that may not feed a job.
    pub fn ensure_usable_as_input(&self) -> DomainResult<()> {
        if self.status.accepts_jobs() {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "storage {} is {} and cannot be used as job input",
                self.id, self.status
            )))
        }
    }
}
