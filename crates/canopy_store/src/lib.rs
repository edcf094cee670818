//! # Canopy Store
//!
//! Local store trait and implementations for Canopy.
//!
//! This crate provides the lowest-level storage abstraction for the replica
//! core. A local store is an **opaque, durable, string-keyed map** - it does
//! not interpret the keys or values it holds. The engine owns all key layout
//! and consistency; stores provide only `get`/`set`/`delete`/`contains`.
//!
//! ## Design Principles
//!
//! - Stores are simple string maps with no transactionality
//! - No knowledge of paths, short keys, or record layout
//! - Must be `Send + Sync` for concurrent access
//! - Absence is a normal state, never an error
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral replicas
//! - [`FileStore`] - For persistent storage using a JSON snapshot file
//!
//! ## Example
//!
//! ```rust
//! use canopy_store::{KvStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! store.set("greeting", "hello").unwrap();
//! assert_eq!(store.get("greeting").unwrap().as_deref(), Some("hello"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod kv;
mod memory;

pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use kv::KvStore;
pub use memory::MemoryStore;
