//! Reconnecting event-stream ingest.
//!
//! One background thread owns the connection lifecycle: connect, read
//! chunks, feed them to an incremental frame reader, and hand decoded
//! updates to the sink. Any read failure, end-of-stream, or revocation
//! tears the connection down and reconnects after a fixed delay. The
//! loop only exits when told to stop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use canopy_protocol::{FrameReader, Path, StreamEvent, StreamUpdate};
use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ReplicaConfig;

/// Lifecycle state of the ingest loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// A connection attempt is in progress.
    Connecting,
    /// Frames are being read.
    Streaming,
    /// Waiting out the delay before the next connection attempt.
    Reconnecting,
    /// The loop has been stopped and will not reconnect.
    Closed,
}

/// A stream transport or protocol failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The transport failed to connect or read.
    #[error("stream transport error: {0}")]
    Transport(String),
    /// No data arrived within the idle timeout.
    #[error("stream idle timeout")]
    Timeout,
    /// The server revoked the subscription.
    #[error("stream subscription revoked")]
    Revoked,
}

/// One established stream connection.
pub trait StreamConnection: Send {
    /// Reads the next chunk of bytes, blocking up to `idle_timeout`.
    ///
    /// `Ok(None)` is a clean end-of-stream; either outcome other than
    /// `Ok(Some(_))` makes the ingest loop reconnect.
    fn read_chunk(&mut self, idle_timeout: Duration) -> Result<Option<Vec<u8>>, StreamError>;

    /// Releases the connection. The default does nothing.
    fn close(&mut self) {}
}

/// Opens stream connections for a subscribed path-root.
pub trait StreamTransport: Send + Sync {
    /// Establishes a connection streaming updates under `root`.
    fn connect(
        &self,
        root: &Path,
        connect_timeout: Duration,
    ) -> Result<Box<dyn StreamConnection>, StreamError>;
}

/// Receives decoded updates and stream-level errors from the ingest loop.
pub trait UpdateSink: Send + Sync {
    /// Applies one decoded update.
    fn apply_update(&self, update: StreamUpdate);

    /// Reports a stream-level error the caller may want to observe.
    fn stream_error(&self, error: StreamError);
}

struct IngestShared {
    root: Path,
    transport: Arc<dyn StreamTransport>,
    sink: Arc<dyn UpdateSink>,
    state: RwLock<StreamState>,
    stopped: AtomicBool,
    wakeup: Mutex<()>,
    cond: Condvar,
    reconnects: AtomicU64,
    connect_timeout: Duration,
    idle_timeout: Duration,
    reconnect_delay: Duration,
}

impl IngestShared {
    fn set_state(&self, state: StreamState) {
        *self.state.write() = state;
    }

    /// Sleeps the reconnect delay, returning early if stopped.
    fn wait_reconnect_delay(&self) {
        let mut guard = self.wakeup.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.cond.wait_for(&mut guard, self.reconnect_delay);
    }

    fn run_loop(&self) {
        let mut first_attempt = true;
        while !self.stopped.load(Ordering::SeqCst) {
            if first_attempt {
                first_attempt = false;
            } else {
                self.set_state(StreamState::Reconnecting);
                self.reconnects.fetch_add(1, Ordering::SeqCst);
                self.wait_reconnect_delay();
                if self.stopped.load(Ordering::SeqCst) {
                    break;
                }
            }

            self.set_state(StreamState::Connecting);
            let mut connection = match self.transport.connect(&self.root, self.connect_timeout) {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(root = %self.root, error = %err, "stream connect failed");
                    continue;
                }
            };

            self.set_state(StreamState::Streaming);
            self.pump(connection.as_mut());
            connection.close();
        }
        self.set_state(StreamState::Closed);
    }

    /// Reads and dispatches frames until the connection dies or the loop
    /// is told to stop or reconnect.
    fn pump(&self, connection: &mut dyn StreamConnection) {
        let mut reader = FrameReader::new();
        while !self.stopped.load(Ordering::SeqCst) {
            let chunk = match connection.read_chunk(self.idle_timeout) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    debug!(root = %self.root, "stream ended");
                    return;
                }
                Err(err) => {
                    warn!(root = %self.root, error = %err, "stream read failed");
                    return;
                }
            };

            reader.push(&chunk);
            loop {
                match reader.next_frame() {
                    Ok(Some(frame)) => match StreamEvent::from_frame(&frame) {
                        Ok(event) => {
                            if self.handle_event(event) {
                                return;
                            }
                        }
                        Err(err) => {
                            // A bad frame is dropped; the stream itself
                            // is still usable.
                            warn!(root = %self.root, error = %err, "skipping malformed frame");
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(root = %self.root, error = %err, "skipping malformed frame");
                    }
                }
            }
        }
    }

    /// Handles one event, returning `true` when the connection must be
    /// torn down.
    fn handle_event(&self, event: StreamEvent) -> bool {
        match &event {
            StreamEvent::KeepAlive => false,
            StreamEvent::Cancel => {
                self.sink.stream_error(StreamError::Revoked);
                true
            }
            StreamEvent::AuthRevoked => {
                debug!(root = %self.root, "stream credentials revoked, reconnecting");
                true
            }
            StreamEvent::Put(_) | StreamEvent::Patch(_) => {
                if let Some(update) = StreamUpdate::from_event(&self.root, &event) {
                    self.sink.apply_update(update);
                }
                false
            }
        }
    }
}

/// Handle for one running ingest loop.
///
/// Dropping the handle stops the loop and joins its thread.
pub struct StreamIngest {
    shared: Arc<IngestShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamIngest {
    /// Starts an ingest loop streaming updates under `root` into `sink`.
    #[must_use]
    pub fn start(
        config: &ReplicaConfig,
        root: Path,
        transport: Arc<dyn StreamTransport>,
        sink: Arc<dyn UpdateSink>,
    ) -> Self {
        let shared = Arc::new(IngestShared {
            root,
            transport,
            sink,
            state: RwLock::new(StreamState::Connecting),
            stopped: AtomicBool::new(false),
            wakeup: Mutex::new(()),
            cond: Condvar::new(),
            reconnects: AtomicU64::new(0),
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            reconnect_delay: config.reconnect_delay,
        });

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("canopy-stream".to_string())
            .spawn(move || loop_shared.run_loop())
            .ok();

        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.shared.state.read()
    }

    /// Number of reconnect cycles entered so far.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::SeqCst)
    }

    /// Stops the loop and joins its thread. Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        {
            let _guard = self.shared.wakeup.lock();
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.shared.set_state(StreamState::Closed);
    }
}

impl Drop for StreamIngest {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scripted transport for tests.
///
/// Each scripted connection is a sequence of chunks followed by a
/// terminal outcome. Once the script is exhausted, further connects
/// yield an idle connection that stays open without producing data.
pub struct ScriptedStreamTransport {
    connections: Mutex<std::collections::VecDeque<ScriptedConnectionSpec>>,
    connects: AtomicU64,
}

/// Script for one connection handed out by [`ScriptedStreamTransport`].
pub struct ScriptedConnectionSpec {
    /// Chunks returned by successive reads.
    pub chunks: Vec<Vec<u8>>,
    /// Outcome after the chunks run out. `None` means clean end-of-stream.
    pub terminal: Option<StreamError>,
}

impl ScriptedStreamTransport {
    /// Creates a transport with no scripted connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(std::collections::VecDeque::new()),
            connects: AtomicU64::new(0),
        }
    }

    /// Appends a connection script.
    pub fn push_connection(&self, spec: ScriptedConnectionSpec) {
        self.connections.lock().push_back(spec);
    }

    /// Number of connections handed out.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedStreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTransport for ScriptedStreamTransport {
    fn connect(
        &self,
        _root: &Path,
        _connect_timeout: Duration,
    ) -> Result<Box<dyn StreamConnection>, StreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.connections.lock().pop_front() {
            Some(spec) => Ok(Box::new(ScriptedConnection {
                chunks: spec.chunks.into_iter().collect(),
                terminal: spec.terminal,
            })),
            None => Ok(Box::new(IdleConnection)),
        }
    }
}

struct ScriptedConnection {
    chunks: std::collections::VecDeque<Vec<u8>>,
    terminal: Option<StreamError>,
}

impl StreamConnection for ScriptedConnection {
    fn read_chunk(&mut self, _idle_timeout: Duration) -> Result<Option<Vec<u8>>, StreamError> {
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => match self.terminal.take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }
}

/// Stays connected without producing data, so an exhausted script keeps
/// the loop parked in the streaming state.
struct IdleConnection;

impl StreamConnection for IdleConnection {
    fn read_chunk(&mut self, idle_timeout: Duration) -> Result<Option<Vec<u8>>, StreamError> {
        std::thread::sleep(idle_timeout.min(Duration::from_millis(20)));
        Ok(Some(Vec::new()))
    }
}
