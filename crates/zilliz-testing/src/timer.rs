//! Backoff timer that records instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use zilliz_connect::BackoffTimer;

/// [`BackoffTimer`] that returns immediately and remembers every delay.
///
/// Clones share the same record, so keep one to inspect after handing the
/// other to a connector or pool.
#[derive(Debug, Clone, Default)]
pub struct RecordingTimer {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingTimer {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    /// Sum of all requested delays.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.delays.lock().iter().sum()
    }
}

#[async_trait]
impl BackoffTimer for RecordingTimer {
    async fn wait(&self, delay: Duration) {
        self.delays.lock().push(delay);
    }
}
