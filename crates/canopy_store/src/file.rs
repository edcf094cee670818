//! File-backed local store for persistent replicas.

use crate::error::{StoreError, StoreResult};
use crate::kv::KvStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A file-backed local store.
///
/// The store keeps all entries in memory and mirrors them to a single JSON
/// snapshot file on every mutation. Writes go to a temporary file which is
/// renamed over the snapshot, so a crash mid-write leaves the previous
/// snapshot intact.
///
/// This is intended for replicas with modest entry counts (the engine stores
/// one short-keyed record per path with data). Larger deployments should
/// provide their own [`KvStore`] implementation.
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```no_run
/// use canopy_store::{FileStore, KvStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("replica.json")).unwrap();
/// store.set("k", "v").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens or creates a file store at the given path.
    ///
    /// If the snapshot file exists its entries are loaded; otherwise the
    /// store starts empty and the file is created on first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its contents are not
    /// a valid JSON string map.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let entries = if path.exists() {
            let raw = fs::read_to_string(path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Corrupted(e.to_string()))?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of entries currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        let raw = serde_json::to_string(entries)
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(raw.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.lock().contains_key(key))
    }
}
