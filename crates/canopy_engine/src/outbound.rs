//! Outbound write transport.
//!
//! The dispatcher pushes confirmed local mutations to the server through
//! the [`OutboundWriter`] trait. Implementations block for the duration of
//! one attempt and honor the cancellation flag on a best-effort basis.
//! [`MockOutboundWriter`] is the in-process implementation used by tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use canopy_protocol::{Blob, Path};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// A failed outbound write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The server rejected the caller's credentials. The pending change
    /// is reverted.
    #[error("write rejected: unauthorized")]
    Unauthorized,
    /// The target path does not exist on the server.
    #[error("write rejected: not found")]
    NotFound,
    /// A server-side precondition failed.
    #[error("write rejected: precondition failed")]
    PreconditionFailed,
    /// The server is temporarily unavailable.
    #[error("write failed: service unavailable")]
    ServiceUnavailable,
    /// A transport-level failure.
    #[error("write failed: {0}")]
    Transient(String),
}

impl WriteError {
    /// Whether the pending local change survives this failure.
    ///
    /// Only an authorization rejection reverts the pending change; every
    /// other failure leaves it in place for a later push.
    #[must_use]
    pub fn preserves_pending(&self) -> bool {
        !matches!(self, Self::Unauthorized)
    }
}

/// Pushes one value (or deletion) for one path to the server.
pub trait OutboundWriter: Send + Sync {
    /// Writes `blob` at `path`, where `None` deletes the path.
    ///
    /// `cancel` is set when a newer write for the same path supersedes
    /// this one; implementations may return early once it is observed,
    /// with any result, since the caller discards cancelled outcomes.
    fn put(
        &self,
        path: &Path,
        blob: Option<&str>,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<(), WriteError>;
}

#[derive(Default)]
struct MockState {
    calls: Vec<(Path, Option<Blob>)>,
    results: HashMap<Path, VecDeque<Result<(), WriteError>>>,
    held: HashSet<Path>,
}

/// Scriptable in-process writer for tests.
///
/// Calls are recorded in arrival order. Per-path result queues script
/// failures; unscripted calls succeed. A path can be held to keep its
/// write in flight until released, which is how tests line up
/// supersession races deterministically.
#[derive(Default)]
pub struct MockOutboundWriter {
    state: Mutex<MockState>,
    cond: Condvar,
}

impl MockOutboundWriter {
    /// Creates a writer that records calls and succeeds by default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the result for the next call on `path`.
    pub fn push_result(&self, path: &Path, result: Result<(), WriteError>) {
        self.state
            .lock()
            .results
            .entry(path.clone())
            .or_default()
            .push_back(result);
    }

    /// Blocks future calls on `path` until [`release`](Self::release).
    pub fn hold(&self, path: &Path) {
        self.state.lock().held.insert(path.clone());
    }

    /// Unblocks calls held on `path`.
    pub fn release(&self, path: &Path) {
        self.state.lock().held.remove(path);
        self.cond.notify_all();
    }

    /// All recorded calls, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<(Path, Option<Blob>)> {
        self.state.lock().calls.clone()
    }
}

impl OutboundWriter for MockOutboundWriter {
    fn put(
        &self,
        path: &Path,
        blob: Option<&str>,
        _timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<(), WriteError> {
        let mut state = self.state.lock();
        while state.held.contains(path) {
            self.cond.wait(&mut state);
        }
        // A superseded write that was parked on the hold gate returns
        // without being recorded, matching a server that never saw it.
        if cancel.load(Ordering::SeqCst) {
            return Ok(());
        }
        state.calls.push((path.clone(), blob.map(str::to_string)));
        state
            .results
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_in_order() {
        let writer = MockOutboundWriter::new();
        let cancel = AtomicBool::new(false);
        writer
            .put(&Path::parse("/a"), Some("1"), Duration::ZERO, &cancel)
            .unwrap();
        writer
            .put(&Path::parse("/b"), None, Duration::ZERO, &cancel)
            .unwrap();
        assert_eq!(
            writer.calls(),
            vec![
                (Path::parse("/a"), Some("1".to_string())),
                (Path::parse("/b"), None),
            ]
        );
    }

    #[test]
    fn scripted_results_pop_in_order() {
        let writer = MockOutboundWriter::new();
        let path = Path::parse("/a");
        writer.push_result(&path, Err(WriteError::ServiceUnavailable));
        let cancel = AtomicBool::new(false);

        let first = writer.put(&path, Some("1"), Duration::ZERO, &cancel);
        assert_eq!(first, Err(WriteError::ServiceUnavailable));
        let second = writer.put(&path, Some("1"), Duration::ZERO, &cancel);
        assert_eq!(second, Ok(()));
    }

    #[test]
    fn cancelled_call_is_not_recorded() {
        let writer = MockOutboundWriter::new();
        let cancel = AtomicBool::new(true);
        writer
            .put(&Path::parse("/a"), Some("1"), Duration::ZERO, &cancel)
            .unwrap();
        assert!(writer.calls().is_empty());
    }

    #[test]
    fn unauthorized_does_not_preserve_pending() {
        assert!(!WriteError::Unauthorized.preserves_pending());
        assert!(WriteError::ServiceUnavailable.preserves_pending());
        assert!(WriteError::Transient("reset".into()).preserves_pending());
    }
}
