//! Periodic schema queue status reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dyntab_core::Database;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle for the background status task.
pub struct StatusTask {
    handle: JoinHandle<()>,
    stop_flag: Arc<AtomicBool>,
}

impl StatusTask {
    /// Start reporting the pending job count every `interval`.
    pub fn start(database: Arc<Database>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            let mut last = 0;
            loop {
                ticker.tick().await;

                if stop_flag_clone.load(Ordering::SeqCst) {
                    break;
                }

                let pending = database.queue().pending_count();
                if pending > 0 || last > 0 {
                    info!(pending_jobs = pending, "schema job queue");
                }
                last = pending;
            }
        });

        Self { handle, stop_flag }
    }

    /// Signal the task to stop.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Stop the task and wait for it.
    pub async fn join(self) {
        self.stop();
        self.handle.abort();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "status task panicked");
            }
        }
    }
}
