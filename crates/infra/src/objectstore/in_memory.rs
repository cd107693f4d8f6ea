//! In-memory object store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use geotill_core::StorageId;

use super::{Object, ObjectStore, ObjectStoreError};
use crate::volume::Volume;

type Files = BTreeMap<PathBuf, Vec<u8>>;

/// In-memory object store.
///
/// Blobs are held as `relative path -> bytes` maps.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<StorageId, Files>>,
}

fn poisoned() -> ObjectStoreError {
    ObjectStoreError::Backend("lock poisoned".to_string())
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a blob directly.
    pub fn insert<P, B>(&self, id: StorageId, files: impl IntoIterator<Item = (P, B)>) -> Result<(), ObjectStoreError>
    where
        P: Into<PathBuf>,
        B: Into<Vec<u8>>,
    {
        let files = files.into_iter().map(|(p, b)| (p.into(), b.into())).collect();
        self.objects.write().map_err(|_| poisoned())?.insert(id, files);
        Ok(())
    }

    pub fn contains(&self, id: StorageId) -> bool {
        self.objects.read().map(|o| o.contains_key(&id)).unwrap_or(false)
    }

    /// Contents of a blob, if present.
    pub fn files(&self, id: StorageId) -> Option<Files> {
        self.objects.read().ok().and_then(|o| o.get(&id).cloned())
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot of a blob taken at `get_object` time.
#[derive(Debug, Clone)]
pub struct InMemoryObject {
    files: Files,
}

impl Object for InMemoryObject {
    fn download(&self, volume: &Volume) -> Result<(), ObjectStoreError> {
        for (relative, bytes) in &self.files {
            let target = volume.path().join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, bytes)?;
        }
        Ok(())
    }
}

impl ObjectStore for InMemoryObjectStore {
    type Object = InMemoryObject;

    fn get_object(&self, id: StorageId) -> Result<InMemoryObject, ObjectStoreError> {
        self.objects
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .map(|files| InMemoryObject { files })
            .ok_or(ObjectStoreError::NotFound(id))
    }

    fn put_object(&self, id: StorageId, volume: &Volume) -> Result<(), ObjectStoreError> {
        let mut files = Files::new();
        for file in volume.walk() {
            let file = file?;
            let bytes = std::fs::read(&file.path)?;
            files.insert(file.relative, bytes);
        }
        self.objects.write().map_err(|_| poisoned())?.insert(id, files);
        Ok(())
    }

    fn delete_object(&self, id: StorageId) -> Result<(), ObjectStoreError> {
        self.objects
            .write()
            .map_err(|_| poisoned())?
            .remove(&id)
            .map(|_| ())
            .ok_or(ObjectStoreError::NotFound(id))
    }
}
