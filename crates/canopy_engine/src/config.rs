//! Configuration for the replica engine.

use std::time::Duration;

/// Configuration for a replica store.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Maximum number of concurrently executing outbound writes.
    ///
    /// This sizes the dispatcher's worker pool; queued writes wait FIFO
    /// for a free worker.
    pub max_concurrent_writes: usize,
    /// Timeout for each outbound write attempt.
    pub write_timeout: Duration,
    /// Timeout for establishing a stream connection.
    pub connect_timeout: Duration,
    /// Maximum time between stream reads before the connection is
    /// considered dead. Keep-alive frames reset this.
    pub idle_timeout: Duration,
    /// Fixed delay before a stream reconnect attempt.
    pub reconnect_delay: Duration,
}

impl ReplicaConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_concurrent_writes: 4,
            write_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(2),
        }
    }

    /// Sets the maximum number of concurrent outbound writes.
    ///
    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_max_concurrent_writes(mut self, count: usize) -> Self {
        self.max_concurrent_writes = count.max(1);
        self
    }

    /// Sets the per-attempt write timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the stream connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the stream idle read timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the fixed stream reconnect delay.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self::new()
    }
}
