//! Bounded-concurrency outbound write dispatcher.
//!
//! Writes are queued FIFO and executed by a fixed pool of worker threads,
//! so at most `max_concurrent_writes` attempts run at once. Each path has
//! at most one live task: submitting the same value again coalesces into
//! the task already in flight, and submitting a different value cancels
//! the old task and replaces it. Cancelled tasks never invoke their
//! callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use canopy_protocol::{Blob, Path};
use parking_lot::Mutex;
use tracing::debug;

use crate::outbound::{OutboundWriter, WriteError};

/// Invoked with the written value after the server confirms a write.
pub type SuccessCallback = Box<dyn FnOnce(Option<Blob>) + Send>;
/// Invoked when a write attempt fails.
pub type ErrorCallback = Box<dyn FnOnce(WriteError) + Send>;

struct WriteTask {
    path: Path,
    blob: Option<Blob>,
    cancelled: Arc<AtomicBool>,
    on_success: SuccessCallback,
    on_error: ErrorCallback,
}

struct ActiveWrite {
    blob: Option<Blob>,
    cancelled: Arc<AtomicBool>,
}

struct DispatcherShared {
    writer: Arc<dyn OutboundWriter>,
    active: Mutex<HashMap<Path, ActiveWrite>>,
    write_timeout: Duration,
}

impl DispatcherShared {
    /// Removes the registry entry for `path` only if it still belongs to
    /// this task. A superseding task may have replaced the entry while
    /// this one was in flight.
    fn remove_if_current(&self, path: &Path, cancelled: &Arc<AtomicBool>) {
        let mut active = self.active.lock();
        if let Some(entry) = active.get(path) {
            if Arc::ptr_eq(&entry.cancelled, cancelled) {
                active.remove(path);
            }
        }
    }

    fn run_task(&self, task: WriteTask) {
        if task.cancelled.load(Ordering::SeqCst) {
            self.remove_if_current(&task.path, &task.cancelled);
            return;
        }

        let result = self.writer.put(
            &task.path,
            task.blob.as_deref(),
            self.write_timeout,
            &task.cancelled,
        );

        // A task superseded while in flight is discarded whole: no
        // callbacks, and the registry entry belongs to its successor.
        if task.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.remove_if_current(&task.path, &task.cancelled);

        match result {
            Ok(()) => (task.on_success)(task.blob),
            Err(err) => {
                debug!(path = %task.path, error = %err, "outbound write failed");
                (task.on_error)(err);
            }
        }
    }
}

/// FIFO write queue drained by a fixed worker pool.
pub struct WriteDispatcher {
    shared: Arc<DispatcherShared>,
    queue: Mutex<Option<Sender<WriteTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteDispatcher {
    /// Creates a dispatcher running up to `max_concurrent` writes at once.
    #[must_use]
    pub fn new(
        writer: Arc<dyn OutboundWriter>,
        max_concurrent: usize,
        write_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(DispatcherShared {
            writer,
            active: Mutex::new(HashMap::new()),
            write_timeout,
        });

        let (sender, receiver) = mpsc::channel::<WriteTask>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::new();
        for i in 0..max_concurrent.max(1) {
            let shared = Arc::clone(&shared);
            let receiver = Arc::clone(&receiver);
            let spawned = std::thread::Builder::new()
                .name(format!("canopy-write-{i}"))
                .spawn(move || worker_loop(&shared, &receiver));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => debug!(error = %err, "failed to spawn write worker"),
            }
        }

        Self {
            shared,
            queue: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queues a write for `path`.
    ///
    /// If a task for the same path and same value is already live the new
    /// submission coalesces into it and its callbacks are dropped. If the
    /// live task carries a different value it is cancelled and replaced.
    pub fn submit(
        &self,
        path: Path,
        blob: Option<Blob>,
        on_success: SuccessCallback,
        on_error: ErrorCallback,
    ) {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.shared.active.lock();
            if let Some(existing) = active.get(&path) {
                if existing.blob == blob {
                    return;
                }
                existing.cancelled.store(true, Ordering::SeqCst);
            }
            active.insert(
                path.clone(),
                ActiveWrite {
                    blob: blob.clone(),
                    cancelled: Arc::clone(&cancelled),
                },
            );
        }

        let task = WriteTask {
            path,
            blob,
            cancelled,
            on_success,
            on_error,
        };
        if let Some(sender) = self.queue.lock().as_ref() {
            // Send only fails after shutdown; the task is then dropped.
            let _ = sender.send(task);
        }
    }

    /// Cancels the live task for `path`, if any. The task's callbacks will
    /// not run.
    pub fn cancel(&self, path: &Path) {
        if let Some(entry) = self.shared.active.lock().remove(path) {
            entry.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Number of paths with a live task.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.active.lock().len()
    }

    /// Stops accepting tasks and joins the workers after the queue drains.
    pub fn shutdown(&self) {
        self.queue.lock().take();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &DispatcherShared, receiver: &Mutex<Receiver<WriteTask>>) {
    loop {
        // Hold the receiver lock only while dequeuing so other workers
        // can pick up tasks while this one executes.
        let task = match receiver.lock().recv() {
            Ok(task) => task,
            Err(_) => return,
        };
        shared.run_task(task);
    }
}
