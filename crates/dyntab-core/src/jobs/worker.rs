//! Background worker threads draining the schema job queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::orchestrator::JobOrchestrator;
use crate::error::Result;

/// Pool of worker threads polling the orchestrator.
///
/// Any worker may run any job; per-table ordering is enforced by the queue.
pub struct JobWorkerPool {
    /// Shutdown signal.
    shutdown: Arc<AtomicBool>,
    /// Worker thread handles.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobWorkerPool {
    /// Start `worker_count` workers as configured on the orchestrator.
    pub fn start(orchestrator: Arc<JobOrchestrator>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let count = orchestrator.config().worker_count.max(1);
        let mut handles = Vec::with_capacity(count);

        for worker in 0..count {
            let orchestrator = orchestrator.clone();
            let stop = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("dyntab-job-{worker}"))
                .spawn(move || Self::worker_loop(worker, orchestrator, stop));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(workers = count, "started schema job workers");
        Ok(Self {
            shutdown,
            handles: Mutex::new(handles),
        })
    }

    /// Signal the workers to stop and wait for them.
    ///
    /// A job already executing runs to completion first.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Check if any worker is still running.
    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|h| !h.is_finished())
    }

    fn worker_loop(worker: usize, orchestrator: Arc<JobOrchestrator>, shutdown: Arc<AtomicBool>) {
        let poll_interval = orchestrator.config().poll_interval;

        while !shutdown.load(Ordering::SeqCst) {
            match orchestrator.run_once() {
                Ok(Some(_)) => continue,
                Ok(None) => thread::sleep(poll_interval),
                Err(e) => {
                    tracing::error!(worker, error = ?e, "schema job worker failed to poll queue");
                    thread::sleep(poll_interval);
                }
            }
        }

        tracing::debug!(worker, "schema job worker stopped");
    }
}

impl Drop for JobWorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MetadataStore, NewTable};
    use crate::config::OrchestratorConfig;
    use crate::ddl::DdlService;
    use crate::engine::{Engine, SqliteEngine};
    use crate::jobs::{JobOperation, JobQueue};
    use crate::naming;
    use std::time::{Duration, Instant};

    #[test]
    fn test_pool_drains_queue_and_stops() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let catalog = MetadataStore::open(&db).unwrap();
        let queue = JobQueue::open(&db).unwrap();
        let engine = Arc::new(SqliteEngine::in_memory().unwrap());
        let config = OrchestratorConfig::default()
            .with_worker_count(3)
            .with_poll_interval(Duration::from_millis(5));
        let orchestrator = Arc::new(JobOrchestrator::new(
            catalog.clone(),
            queue.clone(),
            DdlService::new(engine.clone()),
            config,
        ));

        let mut tables = Vec::new();
        for i in 0..4 {
            let table = catalog
                .create_table(&NewTable::new(1, format!("t{i}")))
                .unwrap();
            queue.enqueue(table.id, JobOperation::EnsureTable, 0).unwrap();
            tables.push(table.id);
        }

        let pool = JobWorkerPool::start(orchestrator).unwrap();
        assert!(pool.is_running());

        let deadline = Instant::now() + Duration::from_secs(10);
        while queue.pending_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pool.stop();
        assert!(!pool.is_running());

        assert_eq!(queue.pending_count(), 0);
        for id in tables {
            assert!(engine.table_exists(&naming::physical_table_name(id)).unwrap());
        }
    }

    #[test]
    fn test_workers_share_one_shutdown_flag() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let orchestrator = Arc::new(JobOrchestrator::new(
            MetadataStore::open(&db).unwrap(),
            JobQueue::open(&db).unwrap(),
            DdlService::new(Arc::new(SqliteEngine::in_memory().unwrap())),
            OrchestratorConfig::default()
                .with_worker_count(4)
                .with_poll_interval(Duration::from_millis(5)),
        ));

        let pool = JobWorkerPool::start(orchestrator).unwrap();
        assert!(pool.is_running());
        pool.stop();
        assert!(!pool.is_running());
        pool.stop();
        assert!(!pool.is_running());
    }
}
