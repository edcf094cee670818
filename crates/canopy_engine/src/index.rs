//! Path-to-short-key index.
//!
//! Record data is stored under fixed-length random short keys rather than
//! full paths, keeping storage keys bounded regardless of path depth. The
//! index maintains the 1:1 mapping both ways and persists it as a single
//! JSON catalog entry in the store.
//!
//! The index has no interior locking; the facade serializes access behind
//! its own state lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use canopy_protocol::Path;
use canopy_store::KvStore;
use rand::Rng;

use crate::error::{EngineError, EngineResult};

const KEY_LEN: usize = 8;
const KEY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Storage key holding the persisted path catalog.
pub(crate) const CATALOG_KEY: &str = "canopy/index";

/// A fixed-length random identifier standing in for one path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShortKey(String);

impl ShortKey {
    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bidirectional path/short-key index backed by a persisted catalog.
///
/// The forward map is ordered by path so that all descendants of a path
/// form one contiguous range and can be listed with a range scan.
pub struct PathIndex {
    store: Arc<dyn KvStore>,
    forward: BTreeMap<Path, ShortKey>,
    reverse: HashMap<String, Path>,
}

impl PathIndex {
    /// Loads the index from the store's catalog entry, starting empty if
    /// none exists.
    pub fn load(store: Arc<dyn KvStore>) -> EngineResult<Self> {
        let mut forward = BTreeMap::new();
        let mut reverse = HashMap::new();

        if let Some(raw) = store.get(CATALOG_KEY)? {
            let catalog: HashMap<String, String> = serde_json::from_str(&raw)
                .map_err(|e| EngineError::IndexCorrupted(e.to_string()))?;
            for (path_text, key_text) in catalog {
                let path = Path::parse(&path_text);
                if let Some(previous) = reverse.insert(key_text.clone(), path.clone()) {
                    return Err(EngineError::IndexCorrupted(format!(
                        "short key {key_text} mapped to both {previous} and {path}"
                    )));
                }
                forward.insert(path, ShortKey(key_text));
            }
        }

        Ok(Self {
            store,
            forward,
            reverse,
        })
    }

    /// Returns the short key for a path, minting and persisting one if the
    /// path is unmapped.
    pub fn ensure_key(&mut self, path: &Path) -> EngineResult<ShortKey> {
        if let Some(key) = self.forward.get(path) {
            return Ok(key.clone());
        }

        let mut rng = rand::thread_rng();
        let key = loop {
            let candidate: String = (0..KEY_LEN)
                .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
                .collect();
            if !self.reverse.contains_key(&candidate) {
                break ShortKey(candidate);
            }
        };

        self.forward.insert(path.clone(), key.clone());
        self.reverse.insert(key.0.clone(), path.clone());
        self.persist()?;
        Ok(key)
    }

    /// Returns the short key for a path, if one is mapped.
    #[must_use]
    pub fn lookup_key(&self, path: &Path) -> Option<ShortKey> {
        self.forward.get(path).cloned()
    }

    /// Returns the path a short key is mapped to.
    #[must_use]
    pub fn path_for(&self, key: &ShortKey) -> Option<&Path> {
        self.reverse.get(key.as_str())
    }

    /// Removes a path's mapping, persisting the catalog if anything was
    /// removed. Returns the released key.
    pub fn release_key(&mut self, path: &Path) -> EngineResult<Option<ShortKey>> {
        match self.forward.remove(path) {
            Some(key) => {
                self.reverse.remove(key.as_str());
                self.persist()?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Lists mapped strict descendants of a path, in path order.
    #[must_use]
    pub fn descendants_of(&self, path: &Path) -> Vec<Path> {
        self.forward
            .range::<Path, _>((Bound::Excluded(path), Bound::Unbounded))
            .map(|(p, _)| p)
            .take_while(|p| p.starts_with(path))
            .cloned()
            .collect()
    }

    /// Lists mapped paths at or under a path, in path order.
    #[must_use]
    pub fn paths_under(&self, path: &Path) -> Vec<Path> {
        let mut out = Vec::new();
        if self.forward.contains_key(path) {
            out.push(path.clone());
        }
        out.extend(self.descendants_of(path));
        out
    }

    /// All mapped paths, in path order.
    #[must_use]
    pub fn mapped_paths(&self) -> Vec<Path> {
        self.forward.keys().cloned().collect()
    }

    /// Number of mapped paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// True when no paths are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    fn persist(&self) -> EngineResult<()> {
        let catalog: HashMap<String, &str> = self
            .forward
            .iter()
            .map(|(path, key)| (path.to_string(), key.as_str()))
            .collect();
        let raw = serde_json::to_string(&catalog)
            .map_err(|e| EngineError::IndexCorrupted(e.to_string()))?;
        self.store.set(CATALOG_KEY, &raw)?;
        Ok(())
    }
}

impl fmt::Debug for PathIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathIndex")
            .field("mapped", &self.forward.len())
            .finish()
    }
}
