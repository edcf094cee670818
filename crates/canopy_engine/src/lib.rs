//! Offline-first replica engine.
//!
//! This crate keeps a local replica of remote path-addressed data that
//! stays usable without a connection. Local mutations apply immediately,
//! persist across restarts, and are pushed to the server by a
//! bounded-concurrency dispatcher; authoritative values arriving over a
//! reconnecting event stream reconcile against unconfirmed local changes
//! with a three-way merge.
//!
//! The entry point is [`ReplicaStore`], built over any
//! [`canopy_store::KvStore`] and an [`OutboundWriter`] for pushing
//! writes. Stream ingest attaches through [`StreamTransport`], and
//! changes fan out to [`SubscriptionHandle`]s.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod db;
mod dispatcher;
mod error;
mod index;
mod outbound;
mod record;
mod stream;
mod tree;

pub use config::ReplicaConfig;
pub use db::{ErrorEvent, ReplicaStore};
pub use dispatcher::{ErrorCallback, SuccessCallback, WriteDispatcher};
pub use error::{EngineError, EngineResult};
pub use index::{PathIndex, ShortKey};
pub use outbound::{MockOutboundWriter, OutboundWriter, WriteError};
pub use record::{
    ChangeKind, LocalApply, PendingChange, RecordState, RemoteApply, SyncAction,
};
pub use stream::{
    ScriptedConnectionSpec, ScriptedStreamTransport, StreamConnection, StreamError, StreamIngest,
    StreamState, StreamTransport, UpdateSink,
};
pub use tree::{ChangeEvent, SubscriptionHandle};
