use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Interval between checks while draining
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Counts the inbound connections a server is currently serving
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
}

/// RAII guard to ensure connection count is properly decremented
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one connection until the returned guard is dropped
    pub fn track(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Get the current active connection count
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no connection is active or `max_wait` has passed.
    ///
    /// Returns the number of connections still open when it gave up.
    pub async fn drain(&self, max_wait: Duration) -> usize {
        let active = self.active_count();
        if active == 0 {
            return 0;
        }
        info!("Waiting for {} connections to close...", active);

        let deadline = Instant::now() + max_wait;
        let mut last_report = Instant::now();
        loop {
            let remaining = self.active_count();
            if remaining == 0 {
                info!("All connections closed gracefully");
                return 0;
            }
            if Instant::now() >= deadline {
                warn!("Forced shutdown with {} connections still active", remaining);
                return remaining;
            }
            if last_report.elapsed() >= Duration::from_secs(5) {
                info!("Still waiting for {} connections...", remaining);
                last_report = Instant::now();
            }
            let pause = DRAIN_POLL.min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
