use std::future::Future;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Tracks detached pipeline runs so shutdown can wait for them.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tracker: TaskTracker,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait for running tasks. Returns false when the
    /// timeout elapsed first; the remaining tasks keep running detached.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, ?timeout, "waiting for in-flight pipeline runs");
        }
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(remaining = self.tracker.len(), "shutdown grace period elapsed");
                false
            }
        }
    }
}
