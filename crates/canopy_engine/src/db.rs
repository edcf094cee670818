//! The replica store facade.
//!
//! `ReplicaStore` ties the pieces together: per-path reconciliation
//! records persisted through the short-key index, the outbound write
//! dispatcher, stream ingest, and change fan-out to subscription
//! handles. All record transitions run under one state lock so local
//! edits and remote syncs never interleave mid-transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};

use canopy_protocol::{Blob, Path, StreamUpdate};
use canopy_store::KvStore;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ReplicaConfig;
use crate::dispatcher::WriteDispatcher;
use crate::error::{EngineError, EngineResult};
use crate::index::{PathIndex, ShortKey};
use crate::outbound::OutboundWriter;
use crate::record::{ChangeKind, PendingChange, RecordState, SyncAction};
use crate::stream::{StreamError, StreamIngest, StreamTransport, UpdateSink};
use crate::tree::SubscriptionHandle;

/// A non-fatal failure surfaced to error subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// The path involved, when the failure concerns one.
    pub path: Option<Path>,
    /// Human-readable description.
    pub message: String,
}

struct ReplicaInner {
    index: PathIndex,
}

/// An offline-first replica of remote path-addressed data.
///
/// Local mutations apply immediately, are persisted, and are pushed to
/// the server in the background; authoritative values arriving over the
/// stream reconcile against them three-way.
pub struct ReplicaStore {
    config: ReplicaConfig,
    store: Arc<dyn KvStore>,
    inner: Mutex<ReplicaInner>,
    dispatcher: WriteDispatcher,
    handles: Mutex<Vec<Weak<SubscriptionHandle>>>,
    batch_seq: AtomicU64,
    error_subscribers: Mutex<Vec<Sender<ErrorEvent>>>,
}

fn synced_key(key: &ShortKey) -> String {
    format!("r/{key}/s")
}

fn pending_blob_key(key: &ShortKey) -> String {
    format!("r/{key}/p")
}

fn pending_kind_key(key: &ShortKey) -> String {
    format!("r/{key}/k")
}

impl ReplicaStore {
    /// Opens a replica over `store`, resuming any persisted state.
    pub fn new(
        config: ReplicaConfig,
        store: Arc<dyn KvStore>,
        writer: Arc<dyn OutboundWriter>,
    ) -> EngineResult<Arc<Self>> {
        let index = PathIndex::load(Arc::clone(&store))?;
        let dispatcher =
            WriteDispatcher::new(writer, config.max_concurrent_writes, config.write_timeout);

        let replica = Arc::new(Self {
            config,
            store,
            inner: Mutex::new(ReplicaInner { index }),
            dispatcher,
            handles: Mutex::new(Vec::new()),
            batch_seq: AtomicU64::new(0),
            error_subscribers: Mutex::new(Vec::new()),
        });
        replica.resume_pending_writes()?;
        Ok(replica)
    }

    /// Re-submits writes for pending changes that survived a restart.
    fn resume_pending_writes(self: &Arc<Self>) -> EngineResult<()> {
        let resumable: Vec<(Path, Option<Blob>)> = {
            let inner = self.inner.lock();
            let mut found = Vec::new();
            for path in inner.index.mapped_paths() {
                let Some(key) = inner.index.lookup_key(&path) else {
                    continue;
                };
                let record = self.load_record(&key)?;
                if let Some(pending) = record.pending {
                    found.push((path, pending.blob));
                }
            }
            found
        };
        for (path, blob) in resumable {
            debug!(path = %path, "resuming pending write");
            self.submit_write(path, blob);
        }
        Ok(())
    }

    fn load_record(&self, key: &ShortKey) -> EngineResult<RecordState> {
        let synced = self.store.get(&synced_key(key))?;
        let pending = match self.store.get(&pending_kind_key(key))? {
            Some(raw_kind) => {
                let kind =
                    ChangeKind::parse(&raw_kind).ok_or_else(|| EngineError::RecordCorrupted {
                        key: key.to_string(),
                        reason: format!("unknown change kind {raw_kind:?}"),
                    })?;
                let blob = self.store.get(&pending_blob_key(key))?;
                Some(PendingChange { blob, kind })
            }
            None => None,
        };
        Ok(RecordState::new(synced, pending))
    }

    fn save_record(&self, key: &ShortKey, record: &RecordState) -> EngineResult<()> {
        match &record.synced {
            Some(blob) => self.store.set(&synced_key(key), blob)?,
            None => self.store.delete(&synced_key(key))?,
        }
        match &record.pending {
            Some(pending) => {
                self.store.set(&pending_kind_key(key), pending.kind.as_str())?;
                match &pending.blob {
                    Some(blob) => self.store.set(&pending_blob_key(key), blob)?,
                    None => self.store.delete(&pending_blob_key(key))?,
                }
            }
            None => {
                self.store.delete(&pending_kind_key(key))?;
                self.store.delete(&pending_blob_key(key))?;
            }
        }
        Ok(())
    }

    fn purge_record(&self, key: &ShortKey) -> EngineResult<()> {
        self.store.delete(&synced_key(key))?;
        self.store.delete(&pending_blob_key(key))?;
        self.store.delete(&pending_kind_key(key))?;
        Ok(())
    }

    /// Applies a local mutation at `path`, where `None` deletes.
    ///
    /// The change is visible to readers and persisted before this
    /// returns; the push to the server happens in the background.
    /// Returns whether the effective value changed.
    pub fn set(self: &Arc<Self>, path: &Path, value: Option<&str>) -> EngineResult<bool> {
        let new_blob: Option<Blob> = value.map(str::to_string);
        let (changed, schedule) = {
            let mut inner = self.inner.lock();
            let mut record = match inner.index.lookup_key(path) {
                Some(key) => self.load_record(&key)?,
                None => RecordState::default(),
            };
            let outcome = record.apply_local_change(new_blob.clone());
            if record.pending.is_none() && !outcome.schedule_write {
                // No pending change survives and nothing replaces it, so
                // a write still in flight carries a value that no longer
                // exists locally.
                self.dispatcher.cancel(path);
            }
            if record.is_empty() {
                if let Some(key) = inner.index.release_key(path)? {
                    self.purge_record(&key)?;
                }
            } else {
                let key = inner.index.ensure_key(path)?;
                self.save_record(&key, &record)?;
            }
            (outcome.changed, outcome.schedule_write)
        };

        if schedule {
            self.submit_write(path.clone(), new_blob);
        }
        if changed {
            self.notify_changes(vec![path.clone()]);
        }
        Ok(changed)
    }

    /// Returns the effective value at `path`.
    pub fn get(&self, path: &Path) -> EngineResult<Option<Blob>> {
        let inner = self.inner.lock();
        match inner.index.lookup_key(path) {
            Some(key) => Ok(self.load_record(&key)?.effective_value().cloned()),
            None => Ok(None),
        }
    }

    /// True when `path` has an effective value.
    pub fn contains(&self, path: &Path) -> EngineResult<bool> {
        Ok(self.get(path)?.is_some())
    }

    /// Returns the full reconciliation record at `path`, for inspection.
    pub fn record(&self, path: &Path) -> EngineResult<Option<RecordState>> {
        let inner = self.inner.lock();
        match inner.index.lookup_key(path) {
            Some(key) => Ok(Some(self.load_record(&key)?)),
            None => Ok(None),
        }
    }

    /// All paths currently holding a record, in path order.
    #[must_use]
    pub fn mapped_paths(&self) -> Vec<Path> {
        self.inner.lock().index.mapped_paths()
    }

    /// Counts records at or under `root`: `(total, synced)` where a
    /// record is synced when it has no pending change.
    #[must_use]
    pub fn progress(&self, root: &Path) -> (usize, usize) {
        let inner = self.inner.lock();
        let mut total = 0;
        let mut synced = 0;
        for path in inner.index.paths_under(root) {
            let Some(key) = inner.index.lookup_key(&path) else {
                continue;
            };
            total += 1;
            match self.load_record(&key) {
                Ok(record) => {
                    if record.pending.is_none() {
                        synced += 1;
                    }
                }
                Err(err) => warn!(path = %path, error = %err, "unreadable record"),
            }
        }
        (total, synced)
    }

    /// Drops the pending change at `path` and cancels its in-flight
    /// write, reverting the effective value to the last synced one.
    pub fn clear_pending(self: &Arc<Self>, path: &Path) -> EngineResult<bool> {
        self.dispatcher.cancel(path);
        let changed = {
            let mut inner = self.inner.lock();
            let Some(key) = inner.index.lookup_key(path) else {
                return Ok(false);
            };
            let mut record = self.load_record(&key)?;
            if record.pending.is_none() {
                return Ok(false);
            }
            let before = record.effective_value().cloned();
            record.clear_pending();
            if record.is_empty() {
                inner.index.release_key(path)?;
                self.purge_record(&key)?;
            } else {
                self.save_record(&key, &record)?;
            }
            before != record.effective_value().cloned()
        };
        if changed {
            self.notify_changes(vec![path.clone()]);
        }
        Ok(changed)
    }

    /// Applies one authoritative value for one path.
    ///
    /// Returns whether the effective value changed.
    pub fn apply_remote(self: &Arc<Self>, path: &Path, value: Option<Blob>) -> EngineResult<bool> {
        let mut reissues = Vec::new();
        let changed = {
            let mut inner = self.inner.lock();
            self.apply_remote_locked(&mut inner, path, value, &mut reissues)?
        };
        for (path, blob) in reissues {
            self.submit_write(path, blob);
        }
        if changed {
            self.notify_changes(vec![path.clone()]);
        }
        Ok(changed)
    }

    fn apply_remote_locked(
        &self,
        inner: &mut ReplicaInner,
        path: &Path,
        value: Option<Blob>,
        reissues: &mut Vec<(Path, Option<Blob>)>,
    ) -> EngineResult<bool> {
        let existing_key = inner.index.lookup_key(path);
        if existing_key.is_none() && value.is_none() {
            return Ok(false);
        }

        let mut record = match &existing_key {
            Some(key) => self.load_record(key)?,
            None => RecordState::default(),
        };
        let outcome = record.apply_remote_sync(value);

        match outcome.action {
            SyncAction::DeleteRecord => {
                self.dispatcher.cancel(path);
                if let Some(key) = inner.index.release_key(path)? {
                    self.purge_record(&key)?;
                }
            }
            SyncAction::Reissue => {
                let blob = record.pending.as_ref().and_then(|p| p.blob.clone());
                reissues.push((path.clone(), blob));
                let key = inner.index.ensure_key(path)?;
                self.save_record(&key, &record)?;
            }
            SyncAction::None => {
                if record.pending.is_none() {
                    // The authoritative value superseded or confirmed the
                    // pending change; a write still in flight for the old
                    // blob must not reach the server.
                    self.dispatcher.cancel(path);
                }
                let key = inner.index.ensure_key(path)?;
                self.save_record(&key, &record)?;
            }
        }
        Ok(outcome.changed)
    }

    /// Applies one decoded stream update, fanning out to every affected
    /// path. Changed paths are notified as a single batch.
    pub fn apply_stream_update(self: &Arc<Self>, update: &StreamUpdate) -> EngineResult<()> {
        let mut reissues = Vec::new();
        let changed: Vec<Path> = {
            let mut inner = self.inner.lock();
            let ops = self.plan_update_ops(&inner, update);
            let mut changed = Vec::new();
            for (path, value) in ops {
                if self.apply_remote_locked(&mut inner, &path, value, &mut reissues)? {
                    changed.push(path);
                }
            }
            changed
        };

        for (path, blob) in reissues {
            self.submit_write(path, blob);
        }
        if !changed.is_empty() {
            self.notify_changes(changed);
        }
        Ok(())
    }

    /// Expands a stream update into per-path authoritative values.
    ///
    /// A leaf or subtree at `path` supersedes everything previously
    /// recorded beneath it, so stale descendants become deletions.
    fn plan_update_ops(
        &self,
        inner: &ReplicaInner,
        update: &StreamUpdate,
    ) -> Vec<(Path, Option<Blob>)> {
        match update {
            StreamUpdate::Delete(path) => {
                let mut ops: Vec<(Path, Option<Blob>)> = inner
                    .index
                    .paths_under(path)
                    .into_iter()
                    .map(|p| (p, None))
                    .collect();
                if ops.is_empty() {
                    ops.push((path.clone(), None));
                }
                ops
            }
            StreamUpdate::SetLeaf(path, blob) => {
                let mut ops: Vec<(Path, Option<Blob>)> = inner
                    .index
                    .descendants_of(path)
                    .into_iter()
                    .map(|p| (p, None))
                    .collect();
                ops.push((path.clone(), Some(blob.clone())));
                ops
            }
            StreamUpdate::SetSubtree(path, entries) => {
                let targets: Vec<(Path, Option<Blob>)> = entries
                    .iter()
                    .map(|(relative, blob)| (path.join(relative), blob.clone()))
                    .collect();
                let mut ops: Vec<(Path, Option<Blob>)> = inner
                    .index
                    .paths_under(path)
                    .into_iter()
                    .filter(|existing| !targets.iter().any(|(target, _)| target == existing))
                    .map(|p| (p, None))
                    .collect();
                ops.extend(targets);
                ops
            }
        }
    }

    fn submit_write(self: &Arc<Self>, path: Path, blob: Option<Blob>) {
        let success_replica = Arc::downgrade(self);
        let success_path = path.clone();
        let error_replica = Arc::downgrade(self);
        let error_path = path.clone();
        let attempted = blob.clone();

        self.dispatcher.submit(
            path,
            blob,
            Box::new(move |confirmed| {
                if let Some(replica) = success_replica.upgrade() {
                    if let Err(err) = replica.on_write_confirmed(&success_path, confirmed) {
                        warn!(path = %success_path, error = %err, "failed to record write confirmation");
                    }
                }
            }),
            Box::new(move |write_err| {
                if let Some(replica) = error_replica.upgrade() {
                    replica.on_write_failed(&error_path, &attempted, &write_err);
                }
            }),
        );
    }

    /// Marks a pending change as confirmed by the server.
    ///
    /// Only runs when the pending value still matches what was written;
    /// a newer local edit keeps its own pending change. The effective
    /// value is unchanged either way, so no event is emitted.
    fn on_write_confirmed(
        self: &Arc<Self>,
        path: &Path,
        confirmed: Option<Blob>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let Some(key) = inner.index.lookup_key(path) else {
            return Ok(());
        };
        let mut record = self.load_record(&key)?;
        let Some(pending) = &record.pending else {
            return Ok(());
        };
        if pending.blob != confirmed {
            return Ok(());
        }

        record.synced = confirmed;
        record.pending = None;
        if record.is_empty() {
            inner.index.release_key(path)?;
            self.purge_record(&key)?;
        } else {
            self.save_record(&key, &record)?;
        }
        Ok(())
    }

    fn on_write_failed(
        self: &Arc<Self>,
        path: &Path,
        attempted: &Option<Blob>,
        write_err: &crate::outbound::WriteError,
    ) {
        if write_err.preserves_pending() {
            debug!(path = %path, error = %write_err, "write failed, keeping pending change");
            self.emit_error(Some(path.clone()), write_err.to_string());
            return;
        }

        // Unauthorized: the server will never accept this change, so it
        // is reverted.
        match self.revert_rejected_pending(path, attempted) {
            Ok(_) => {}
            Err(err) => warn!(path = %path, error = %err, "failed to revert rejected change"),
        }
        self.emit_error(Some(path.clone()), write_err.to_string());
    }

    /// Drops the pending change at `path`, but only while it still holds
    /// the blob the rejected write carried. A newer local edit that
    /// replaced the pending value in the meantime is left untouched.
    fn revert_rejected_pending(
        self: &Arc<Self>,
        path: &Path,
        attempted: &Option<Blob>,
    ) -> EngineResult<bool> {
        let changed = {
            let mut inner = self.inner.lock();
            let Some(key) = inner.index.lookup_key(path) else {
                return Ok(false);
            };
            let mut record = self.load_record(&key)?;
            let Some(pending) = &record.pending else {
                return Ok(false);
            };
            if &pending.blob != attempted {
                return Ok(false);
            }
            // A resubmission of the same blob may still be queued.
            self.dispatcher.cancel(path);
            let before = record.effective_value().cloned();
            record.clear_pending();
            if record.is_empty() {
                inner.index.release_key(path)?;
                self.purge_record(&key)?;
            } else {
                self.save_record(&key, &record)?;
            }
            before != record.effective_value().cloned()
        };
        if changed {
            self.notify_changes(vec![path.clone()]);
        }
        Ok(changed)
    }

    /// Creates a subscription handle rooted at `path`.
    #[must_use]
    pub fn subscribe_root(self: &Arc<Self>, path: &Path) -> Arc<SubscriptionHandle> {
        let handle = Arc::new(SubscriptionHandle::new(
            path.clone(),
            None,
            Arc::downgrade(self),
        ));
        self.register_handle(&handle);
        handle
    }

    pub(crate) fn register_handle(&self, handle: &Arc<SubscriptionHandle>) {
        self.handles.lock().push(Arc::downgrade(handle));
    }

    /// Registers a receiver for non-fatal error events.
    #[must_use]
    pub fn subscribe_errors(&self) -> Receiver<ErrorEvent> {
        let (tx, rx) = mpsc::channel();
        self.error_subscribers.lock().push(tx);
        rx
    }

    fn emit_error(&self, path: Option<Path>, message: String) {
        let event = ErrorEvent { path, message };
        self.error_subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Starts stream ingest for `root` over `transport`, feeding decoded
    /// updates back into this replica.
    ///
    /// The returned ingest stops when dropped; attach it to a
    /// subscription handle to tie the lifetimes together.
    #[must_use]
    pub fn start_stream(
        self: &Arc<Self>,
        root: &Path,
        transport: Arc<dyn StreamTransport>,
    ) -> StreamIngest {
        let sink = Arc::new(ReplicaSink {
            replica: Arc::downgrade(self),
        });
        StreamIngest::start(&self.config, root.clone(), transport, sink)
    }

    /// Fans a batch of changed paths out to live subscription handles.
    fn notify_changes(&self, changed: Vec<Path>) {
        let batch = self.batch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let live: Vec<Arc<SubscriptionHandle>> = {
            let mut handles = self.handles.lock();
            handles.retain(|weak| weak.strong_count() > 0);
            handles.iter().filter_map(Weak::upgrade).collect()
        };
        for handle in live {
            handle.notify_batch(batch, &changed);
        }
    }

    /// Stops the write dispatcher after draining queued writes.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

/// Routes stream updates and errors back into the replica.
struct ReplicaSink {
    replica: Weak<ReplicaStore>,
}

impl UpdateSink for ReplicaSink {
    fn apply_update(&self, update: StreamUpdate) {
        if let Some(replica) = self.replica.upgrade() {
            if let Err(err) = replica.apply_stream_update(&update) {
                warn!(path = %update.path(), error = %err, "failed to apply stream update");
                replica.emit_error(Some(update.path().clone()), err.to_string());
            }
        }
    }

    fn stream_error(&self, error: StreamError) {
        if let Some(replica) = self.replica.upgrade() {
            replica.emit_error(None, error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{MockOutboundWriter, WriteError};
    use canopy_store::MemoryStore;
    use std::time::Duration;

    fn replica_with(
        writer: &Arc<MockOutboundWriter>,
        store: &Arc<MemoryStore>,
    ) -> Arc<ReplicaStore> {
        ReplicaStore::new(
            ReplicaConfig::new(),
            Arc::clone(store) as Arc<dyn KvStore>,
            Arc::clone(writer) as Arc<dyn OutboundWriter>,
        )
        .unwrap()
    }

    fn replica() -> (Arc<ReplicaStore>, Arc<MockOutboundWriter>) {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        (replica_with(&writer, &store), writer)
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within 5s");
    }

    #[test]
    fn set_is_immediately_visible() {
        let (replica, _writer) = replica();
        let path = Path::parse("/a/b");
        assert!(replica.set(&path, Some("\"v\"")).unwrap());
        assert_eq!(replica.get(&path).unwrap(), Some("\"v\"".to_string()));
        assert!(replica.contains(&path).unwrap());
    }

    #[test]
    fn set_pushes_to_server() {
        let (replica, writer) = replica();
        let path = Path::parse("/a");
        replica.set(&path, Some("1")).unwrap();

        wait_for(|| writer.calls().len() == 1);
        assert_eq!(writer.calls(), vec![(path.clone(), Some("1".to_string()))]);

        // Once confirmed, the record is fully synced.
        wait_for(|| {
            replica
                .record(&path)
                .unwrap()
                .is_some_and(|r| r.pending.is_none())
        });
        let record = replica.record(&path).unwrap().unwrap();
        assert_eq!(record.synced, Some("1".to_string()));
    }

    #[test]
    fn delete_of_unknown_path_is_silent() {
        let (replica, writer) = replica();
        assert!(!replica.set(&Path::parse("/nothing"), None).unwrap());
        assert!(replica.mapped_paths().is_empty());
        std::thread::sleep(Duration::from_millis(50));
        assert!(writer.calls().is_empty());
    }

    #[test]
    fn unauthorized_write_reverts_pending() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/a");
        writer.push_result(&path, Err(WriteError::Unauthorized));
        let replica = replica_with(&writer, &store);
        let errors = replica.subscribe_errors();

        replica.set(&path, Some("1")).unwrap();

        // The rejected create leaves nothing behind.
        wait_for(|| replica.mapped_paths().is_empty());
        assert_eq!(replica.get(&path).unwrap(), None);
        let event = errors.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.path, Some(path));
        assert!(event.message.contains("unauthorized"));
    }

    #[test]
    fn remote_supersede_cancels_inflight_write() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/a");
        writer.hold(&path);
        let replica = replica_with(&writer, &store);

        replica.set(&path, Some("b")).unwrap();
        // A different authoritative value supersedes the pending create
        // while its write is still in flight.
        replica.apply_remote(&path, Some("c".to_string())).unwrap();
        writer.release(&path);

        assert_eq!(replica.get(&path).unwrap(), Some("c".to_string()));
        // The superseded blob never reaches the server.
        std::thread::sleep(Duration::from_millis(100));
        assert!(writer.calls().is_empty());
    }

    #[test]
    fn local_delete_of_pending_create_cancels_inflight_write() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/x");
        writer.hold(&path);
        let replica = replica_with(&writer, &store);

        replica.set(&path, Some("1")).unwrap();
        replica.set(&path, None).unwrap();
        writer.release(&path);

        assert!(replica.mapped_paths().is_empty());
        assert_eq!(replica.get(&path).unwrap(), None);
        // The retracted create never lands server-side, so local and
        // remote state stay in agreement.
        std::thread::sleep(Duration::from_millis(100));
        assert!(writer.calls().is_empty());
    }

    #[test]
    fn remote_delete_during_pending_update_cancels_inflight_write() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/a");
        let replica = replica_with(&writer, &store);

        replica.apply_remote(&path, Some("a".to_string())).unwrap();
        writer.hold(&path);
        replica.set(&path, Some("b")).unwrap();
        replica.apply_remote(&path, None).unwrap();
        writer.release(&path);

        assert!(replica.mapped_paths().is_empty());
        std::thread::sleep(Duration::from_millis(100));
        assert!(writer.calls().is_empty());
    }

    #[test]
    fn stale_unauthorized_result_does_not_revert_newer_pending() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/a");
        writer.hold(&path);
        let replica = replica_with(&writer, &store);

        replica.set(&path, Some("2")).unwrap();
        // A rejection for an older attempt arrives after the pending
        // value was replaced; the newer edit must survive.
        replica.on_write_failed(&path, &Some("1".to_string()), &WriteError::Unauthorized);

        assert_eq!(replica.get(&path).unwrap(), Some("2".to_string()));
        writer.release(&path);
        wait_for(|| {
            replica
                .record(&path)
                .unwrap()
                .is_some_and(|r| r.synced == Some("2".to_string()))
        });
    }

    #[test]
    fn unavailable_write_keeps_pending() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/a");
        writer.push_result(&path, Err(WriteError::ServiceUnavailable));
        let replica = replica_with(&writer, &store);
        let errors = replica.subscribe_errors();

        replica.set(&path, Some("1")).unwrap();

        errors.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(replica.get(&path).unwrap(), Some("1".to_string()));
        let record = replica.record(&path).unwrap().unwrap();
        assert!(record.pending.is_some());
    }

    #[test]
    fn clear_pending_reverts_to_synced() {
        let (replica, writer) = replica();
        let path = Path::parse("/a");
        replica.set(&path, Some("1")).unwrap();
        wait_for(|| {
            replica
                .record(&path)
                .unwrap()
                .is_some_and(|r| r.pending.is_none())
        });

        writer.hold(&path);
        replica.set(&path, Some("2")).unwrap();
        assert!(replica.clear_pending(&path).unwrap());
        assert_eq!(replica.get(&path).unwrap(), Some("1".to_string()));
        writer.release(&path);

        // The cancelled write never reaches the server.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(writer.calls().len(), 1);
    }

    #[test]
    fn remote_value_adopted_when_no_pending() {
        let (replica, _writer) = replica();
        let path = Path::parse("/r/x");
        assert!(replica.apply_remote(&path, Some("9".to_string())).unwrap());
        assert_eq!(replica.get(&path).unwrap(), Some("9".to_string()));
        assert!(!replica.apply_remote(&path, Some("9".to_string())).unwrap());
    }

    #[test]
    fn remote_delete_releases_short_key() {
        let (replica, _writer) = replica();
        let path = Path::parse("/r/x");
        replica.apply_remote(&path, Some("9".to_string())).unwrap();
        assert_eq!(replica.mapped_paths().len(), 1);

        replica.apply_remote(&path, None).unwrap();
        assert!(replica.mapped_paths().is_empty());
        assert_eq!(replica.get(&path).unwrap(), None);
    }

    #[test]
    fn stream_leaf_supersedes_descendants() {
        let (replica, _writer) = replica();
        replica
            .apply_remote(&Path::parse("/u/a"), Some("1".to_string()))
            .unwrap();
        replica
            .apply_remote(&Path::parse("/u/b"), Some("2".to_string()))
            .unwrap();

        let update = StreamUpdate::SetLeaf(Path::parse("/u"), "\"flat\"".to_string());
        replica.apply_stream_update(&update).unwrap();

        assert_eq!(replica.get(&Path::parse("/u")).unwrap(), Some("\"flat\"".to_string()));
        assert_eq!(replica.get(&Path::parse("/u/a")).unwrap(), None);
        assert_eq!(replica.get(&Path::parse("/u/b")).unwrap(), None);
        assert_eq!(replica.mapped_paths(), vec![Path::parse("/u")]);
    }

    #[test]
    fn stream_subtree_replaces_previous_records() {
        let (replica, _writer) = replica();
        replica
            .apply_remote(&Path::parse("/u"), Some("\"scalar\"".to_string()))
            .unwrap();
        replica
            .apply_remote(&Path::parse("/u/stale"), Some("0".to_string()))
            .unwrap();

        let update = StreamUpdate::SetSubtree(
            Path::parse("/u"),
            vec![
                (Path::parse("name"), Some("\"n\"".to_string())),
                (Path::parse("age"), Some("3".to_string())),
            ],
        );
        replica.apply_stream_update(&update).unwrap();

        assert_eq!(replica.get(&Path::parse("/u")).unwrap(), None);
        assert_eq!(replica.get(&Path::parse("/u/stale")).unwrap(), None);
        assert_eq!(
            replica.get(&Path::parse("/u/name")).unwrap(),
            Some("\"n\"".to_string())
        );
        assert_eq!(
            replica.get(&Path::parse("/u/age")).unwrap(),
            Some("3".to_string())
        );
    }

    #[test]
    fn stream_delete_clears_subtree() {
        let (replica, _writer) = replica();
        replica
            .apply_remote(&Path::parse("/u/a"), Some("1".to_string()))
            .unwrap();
        replica
            .apply_remote(&Path::parse("/u/a/b"), Some("2".to_string()))
            .unwrap();

        replica
            .apply_stream_update(&StreamUpdate::Delete(Path::parse("/u")))
            .unwrap();
        assert!(replica.mapped_paths().is_empty());
    }

    #[test]
    fn remote_echo_of_pending_write_converges() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/a");
        writer.hold(&path);
        let replica = replica_with(&writer, &store);

        replica.set(&path, Some("1")).unwrap();
        // The stream echoes the value before the write call returns.
        replica.apply_remote(&path, Some("1".to_string())).unwrap();

        let record = replica.record(&path).unwrap().unwrap();
        assert_eq!(record.synced, Some("1".to_string()));
        assert_eq!(record.pending, None);
        writer.release(&path);
    }

    #[test]
    fn unrelated_remote_value_reissues_pending_write() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/a");
        let replica = replica_with(&writer, &store);

        // Establish a synced base, then a pending update held in flight.
        replica.apply_remote(&path, Some("a".to_string())).unwrap();
        writer.hold(&path);
        replica.set(&path, Some("b")).unwrap();

        // The server re-sends the unchanged base; the pending update is
        // still ahead of it and gets pushed again.
        replica.apply_remote(&path, Some("a".to_string())).unwrap();
        writer.release(&path);

        wait_for(|| {
            replica
                .record(&path)
                .unwrap()
                .is_some_and(|r| r.pending.is_none() && r.synced == Some("b".to_string()))
        });
    }

    #[test]
    fn state_survives_reopen() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/keep");
        writer.hold(&path);
        {
            let replica = replica_with(&writer, &store);
            replica.set(&path, Some("\"v\"")).unwrap();
            replica.apply_remote(&Path::parse("/synced"), Some("1".to_string())).unwrap();
            writer.release(&path);
            replica.shutdown();
        }

        let reopened = replica_with(&writer, &store);
        assert_eq!(reopened.get(&path).unwrap(), Some("\"v\"".to_string()));
        assert_eq!(
            reopened.get(&Path::parse("/synced")).unwrap(),
            Some("1".to_string())
        );
    }

    #[test]
    fn pending_write_resumes_after_reopen() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/a");
        writer.hold(&path);
        {
            let replica = replica_with(&writer, &store);
            replica.set(&path, Some("1")).unwrap();
            // Cancel the in-flight task so shutdown does not wait on the
            // held call, leaving the pending change persisted.
            replica.clear_pending(&path).unwrap();
            writer.release(&path);
            replica.shutdown();
        }

        // clear_pending dropped it above; re-create a persisted pending
        // state directly through a fresh replica with held writes.
        writer.hold(&path);
        {
            let replica = replica_with(&writer, &store);
            replica.set(&path, Some("2")).unwrap();
            replica.dispatcher.cancel(&path);
            writer.release(&path);
            replica.shutdown();
        }

        // Reopening finds the surviving pending change and pushes it.
        let replica = replica_with(&writer, &store);
        wait_for(|| {
            writer
                .calls()
                .iter()
                .any(|(p, b)| p == &path && b.as_deref() == Some("2"))
        });
        drop(replica);
    }

    #[test]
    fn rapid_overwrites_collapse_to_last_value() {
        let writer = Arc::new(MockOutboundWriter::new());
        let store = Arc::new(MemoryStore::new());
        let path = Path::parse("/burst");
        writer.hold(&path);
        let replica = replica_with(&writer, &store);

        for i in 0..5 {
            replica.set(&path, Some(&i.to_string())).unwrap();
        }
        writer.release(&path);

        wait_for(|| {
            replica
                .record(&path)
                .unwrap()
                .is_some_and(|r| r.pending.is_none())
        });
        assert_eq!(replica.get(&path).unwrap(), Some("4".to_string()));
        let calls = writer.calls();
        // Superseded writes were cancelled before reaching the server.
        assert_eq!(calls.last(), Some(&(path.clone(), Some("4".to_string()))));
        assert!(calls.len() <= 2);
    }
}
