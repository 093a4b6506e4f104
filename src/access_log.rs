use crate::daily_log::DailyFileWriter;
use chrono::Local;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Default number of pending access lines before new ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Producer side of the access log.
///
/// Enqueueing never waits: when the queue is full the line is dropped and
/// counted, so a slow disk can't slow down request handling.
#[derive(Clone, Debug)]
pub struct AccessLog {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

/// Consumer side, drained by exactly one writer
#[derive(Debug)]
pub struct AccessLogReceiver {
    rx: mpsc::Receiver<String>,
}

impl AccessLog {
    /// Create a bounded queue without starting a writer
    pub fn channel(capacity: usize) -> (AccessLog, AccessLogReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            AccessLog {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            AccessLogReceiver { rx },
        )
    }

    /// Create the queue and spawn its writer on a blocking thread.
    ///
    /// The writer exits once every `AccessLog` clone is dropped and the
    /// remaining lines are written.
    pub fn spawn(sink: Arc<DailyFileWriter>, capacity: usize) -> (AccessLog, JoinHandle<()>) {
        let (log, receiver) = Self::channel(capacity);
        let handle = tokio::task::spawn_blocking(move || receiver.drain_into(&sink));
        (log, handle)
    }

    /// Record one completed request
    pub fn record(&self, ip: &str, user_agent: &str) {
        self.enqueue(format!("[INFO] access: ip={} ua={:?}", ip, user_agent));
    }

    /// Try to enqueue a preformatted line, returning whether it was accepted
    pub fn enqueue(&self, line: String) -> bool {
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Lines discarded because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AccessLogReceiver {
    /// Write queued lines in order until every sender is gone
    pub fn drain_into(mut self, sink: &DailyFileWriter) {
        while let Some(line) = self.rx.blocking_recv() {
            let stamped = format!("{} {}\n", Local::now().format("%Y/%m/%d %H:%M:%S"), line);
            // Sink failures are already routed to its fallback
            let _ = (&*sink).write_all(stamped.as_bytes());
        }
    }

    /// Non-blocking receive, for inspecting the queue
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}
