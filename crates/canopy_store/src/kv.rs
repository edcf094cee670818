//! Local store trait definition.

use crate::error::StoreResult;

/// A durable, string-keyed local store.
///
/// Stores are **opaque string maps**. They provide simple operations for
/// reading, writing, and removing entries. The replica engine owns all key
/// layout interpretation - stores do not understand paths, short keys, or
/// record fields.
///
/// # Invariants
///
/// - `get` returns exactly the value previously written for that key
/// - A missing key is `Ok(None)`, never an error
/// - No transactionality is assumed; the engine is responsible for its own
///   consistency
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`crate::MemoryStore`] - For testing
/// - [`crate::FileStore`] - For persistent storage
pub trait KvStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error only if an I/O failure occurs.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Removes the entry under `key`. Removing a missing key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be made durable.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Returns true if an entry exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error only if an I/O failure occurs.
    fn contains(&self, key: &str) -> StoreResult<bool>;
}
