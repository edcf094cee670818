//! Subscription handles and change fan-out.
//!
//! A handle represents one subscribed path-root. Handles form a tree:
//! a child handle scopes events to a subpath and forwards everything it
//! emits to its parent, so an ancestor subscription observes all
//! descendant activity. Within one propagation batch a handle emits each
//! changed path at most once, even when the same change reaches it both
//! directly and through a child.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};

use canopy_protocol::Path;
use parking_lot::{Mutex, RwLock};

use crate::db::ReplicaStore;
use crate::stream::StreamIngest;

/// One change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The handle's subscribed root.
    pub root: Path,
    /// The changed path, relative to `root`.
    pub path: Path,
    /// Number of records at or under `root`.
    pub total_count: usize,
    /// Number of those records with no pending change.
    pub synced_count: usize,
}

struct BatchSeen {
    batch: u64,
    paths: HashSet<Path>,
}

/// A live subscription to changes at and under one path-root.
pub struct SubscriptionHandle {
    root: Path,
    parent: Option<Arc<SubscriptionHandle>>,
    hub: Weak<ReplicaStore>,
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
    stream: Mutex<Option<StreamIngest>>,
    disposed: AtomicBool,
    seen: Mutex<BatchSeen>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        root: Path,
        parent: Option<Arc<SubscriptionHandle>>,
        hub: Weak<ReplicaStore>,
    ) -> Self {
        Self {
            root,
            parent,
            hub,
            subscribers: RwLock::new(Vec::new()),
            stream: Mutex::new(None),
            disposed: AtomicBool::new(false),
            seen: Mutex::new(BatchSeen {
                batch: 0,
                paths: HashSet::new(),
            }),
        }
    }

    /// The path-root this handle is subscribed to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a handle scoped to a subpath of this one.
    ///
    /// Events emitted by the child are also forwarded here.
    #[must_use]
    pub fn child(self: &Arc<Self>, relative: &Path) -> Arc<SubscriptionHandle> {
        let handle = Arc::new(SubscriptionHandle::new(
            self.root.join(relative),
            Some(Arc::clone(self)),
            self.hub.clone(),
        ));
        if let Some(hub) = self.hub.upgrade() {
            hub.register_handle(&handle);
        }
        handle
    }

    /// Registers a new change-event receiver.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// True while neither this handle nor any ancestor is disposed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        match &self.parent {
            Some(parent) => parent.is_active(),
            None => true,
        }
    }

    /// Attaches a running stream ingest whose lifetime is tied to this
    /// handle. A previously attached ingest is stopped.
    pub fn attach_stream(&self, ingest: StreamIngest) {
        if let Some(previous) = self.stream.lock().replace(ingest) {
            previous.stop();
        }
    }

    /// Stops the attached stream and drops all subscribers. Events no
    /// longer reach this handle or, through it, its parent.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(ingest) = self.stream.lock().take() {
            ingest.stop();
        }
        self.subscribers.write().clear();
    }

    /// Delivers a batch of changed absolute paths.
    ///
    /// Paths outside this handle's root are ignored. Each relative path
    /// is emitted at most once per batch, then the batch is forwarded to
    /// the parent handle.
    pub(crate) fn notify_batch(&self, batch: u64, changed: &[Path]) {
        if !self.is_active() {
            return;
        }
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let (total_count, synced_count) = hub.progress(&self.root);

        let mut emitted = Vec::new();
        {
            let mut seen = self.seen.lock();
            if seen.batch != batch {
                seen.batch = batch;
                seen.paths.clear();
            }
            for path in changed {
                let Some(relative) = path.relative_to(&self.root) else {
                    continue;
                };
                if seen.paths.insert(relative.clone()) {
                    emitted.push(relative);
                }
            }
        }

        if !emitted.is_empty() {
            let mut subscribers = self.subscribers.write();
            for relative in &emitted {
                let event = ChangeEvent {
                    root: self.root.clone(),
                    path: relative.clone(),
                    total_count,
                    synced_count,
                };
                subscribers.retain(|tx| tx.send(event.clone()).is_ok());
            }
        }

        if let Some(parent) = &self.parent {
            parent.notify_batch(batch, changed);
        }
    }
}
