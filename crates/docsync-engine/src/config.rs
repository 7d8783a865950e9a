use std::time::Duration;

/// Timing configuration of a document's sync engine.
///
/// Every wait the caller can be subjected to is bounded by one of these; a
/// wait that times out is not an error, the caller proceeds with local data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long the worker waits for a request before reporting itself idle.
    pub poll_interval: Duration,
    /// Bounded wait for the pull that precedes every read.
    pub read_timeout: Duration,
    /// Bounded wait for pending requests to settle when closing.
    pub settle_timeout: Duration,
    /// Default overall bound of `close()`.
    pub join_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(1),
            settle_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_settle_timeout(mut self, settle_timeout: Duration) -> Self {
        self.settle_timeout = settle_timeout;
        self
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }
}
