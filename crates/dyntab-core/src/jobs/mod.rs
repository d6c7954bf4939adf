//! Asynchronous schema jobs.
//!
//! Metadata changes enqueue jobs; workers claim them in per-table FIFO order
//! and apply them through the DDL service. Execution is at-least-once, so
//! every operation is idempotent.

mod job;
mod orchestrator;
mod queue;
mod worker;

pub use job::{Job, JobOperation, JobOutcome, JobStatus};
pub use orchestrator::{JobOrchestrator, JobReport};
pub use queue::JobQueue;
pub use worker::JobWorkerPool;
