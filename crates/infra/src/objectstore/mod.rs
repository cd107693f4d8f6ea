//! Blob storage keyed by storage ID.
//!
//! A blob is a directory tree: `put_object` uploads every file of a volume,
//! `download` recreates the same relative layout inside another volume.

pub mod filesystem;
pub mod in_memory;

pub use filesystem::FilesystemObjectStore;
pub use in_memory::InMemoryObjectStore;

use std::io;
use std::sync::Arc;

use thiserror::Error;

use geotill_core::StorageId;

use crate::volume::{Volume, VolumeError};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(StorageId),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("object store backend error: {0}")]
    Backend(String),
}

impl ObjectStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound(_))
    }
}

/// Handle to a stored blob.
pub trait Object {
    /// Write the blob's files into `volume`.
    fn download(&self, volume: &Volume) -> Result<(), ObjectStoreError>;
}

pub trait ObjectStore: Send + Sync {
    type Object: Object;

    fn get_object(&self, id: StorageId) -> Result<Self::Object, ObjectStoreError>;

    /// Upload the contents of `volume` under `id`, replacing any previous blob.
    fn put_object(&self, id: StorageId, volume: &Volume) -> Result<(), ObjectStoreError>;

    fn delete_object(&self, id: StorageId) -> Result<(), ObjectStoreError>;
}

impl<S> ObjectStore for Arc<S>
where
    S: ObjectStore + ?Sized,
{
    type Object = S::Object;

    fn get_object(&self, id: StorageId) -> Result<Self::Object, ObjectStoreError> {
        (**self).get_object(id)
    }

    fn put_object(&self, id: StorageId, volume: &Volume) -> Result<(), ObjectStoreError> {
        (**self).put_object(id, volume)
    }

    fn delete_object(&self, id: StorageId) -> Result<(), ObjectStoreError> {
        (**self).delete_object(id)
    }
}
