//! Filesystem-backed object store.
//!
//! Layout: `<root>/<storage id>/<relative paths>`. Uploads are staged under
//! `<root>/.staging/<storage id>` and renamed into place, so a blob directory
//! either holds a complete upload or does not exist.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use geotill_core::StorageId;

use super::{Object, ObjectStore, ObjectStoreError};
use crate::volume::{Volume, VolumeError};

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone)]
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ObjectStoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: StorageId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn staging_path(&self, id: StorageId) -> PathBuf {
        self.root.join(STAGING_DIR).join(id.to_string())
    }
}

/// A blob directory on disk.
#[derive(Debug, Clone)]
pub struct FilesystemObject {
    id: StorageId,
    dir: PathBuf,
}

impl Object for FilesystemObject {
    fn download(&self, volume: &Volume) -> Result<(), ObjectStoreError> {
        // The blob may have been deleted since `get_object`; never recreate it.
        let source = match Volume::open(&self.dir) {
            Ok(source) => source,
            Err(VolumeError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(self.id));
            }
            Err(e) => return Err(e.into()),
        };
        copy_files(&source, volume.path())
    }
}

impl ObjectStore for FilesystemObjectStore {
    type Object = FilesystemObject;

    fn get_object(&self, id: StorageId) -> Result<FilesystemObject, ObjectStoreError> {
        let dir = self.object_path(id);
        if !dir.is_dir() {
            return Err(ObjectStoreError::NotFound(id));
        }
        Ok(FilesystemObject { id, dir })
    }

    fn put_object(&self, id: StorageId, volume: &Volume) -> Result<(), ObjectStoreError> {
        let staging = self.staging_path(id);
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging)?;

        if let Err(e) = copy_files(volume, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let target = self.object_path(id);
        remove_dir_if_exists(&target)?;
        fs::rename(&staging, &target)?;
        debug!(storage_id = %id, path = %target.display(), "object stored");
        Ok(())
    }

    fn delete_object(&self, id: StorageId) -> Result<(), ObjectStoreError> {
        match fs::remove_dir_all(self.object_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ObjectStoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}

fn copy_files(source: &Volume, target: &Path) -> Result<(), ObjectStoreError> {
    for file in source.walk() {
        let file = file?;
        let dest = target.join(&file.relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file.path, &dest)?;
    }
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
