//! Durable job queue in sled.

use super::job::{Job, JobOperation, JobOutcome, JobStatus};
use crate::error::{Error, Result};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Transactional, Tree};
use std::collections::HashSet;
use std::time::Duration;

/// Tree name for job records.
const RECORDS_TREE: &str = "jobs:records";

/// Tree name for the ids of non-terminal jobs.
const PENDING_TREE: &str = "jobs:pending";

/// Durable, per-table FIFO job queue.
///
/// Job ids come from sled's id generator, so key order in `jobs:pending` is
/// enqueue order. A job is claimable only when it is the oldest pending job
/// of its table.
#[derive(Clone)]
pub struct JobQueue {
    db: Db,
    records: Tree,
    pending: Tree,
}

fn abort(err: Error) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(err)
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl JobQueue {
    /// Open or create the queue trees.
    pub fn open(db: &Db) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            records: db.open_tree(RECORDS_TREE)?,
            pending: db.open_tree(PENDING_TREE)?,
        })
    }

    /// Append a job for a table.
    pub fn enqueue(&self, table_id: u64, operation: JobOperation, now: u64) -> Result<Job> {
        let job = Job::new(self.db.generate_id()?, table_id, operation, now);
        let key = job.id.to_be_bytes();
        let bytes = job.to_bytes()?;

        (&self.records, &self.pending).transaction(
            |(records, pending)| -> ConflictableTransactionResult<(), Error> {
                records.insert(&key[..], bytes.clone())?;
                pending.insert(&key[..], &table_id.to_be_bytes()[..])?;
                Ok(())
            },
        )?;

        tracing::debug!(job_id = job.id, table_id, operation = %job.operation, "enqueued job");
        Ok(job)
    }

    /// Get a job by id.
    pub fn get(&self, id: u64) -> Result<Option<Job>> {
        match self.records.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Job::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Claim the next runnable job, taking a lease on it.
    ///
    /// Walks pending jobs in id order. The first pending job seen for a table
    /// blocks that table: if it is running or still backing off, later jobs
    /// of the same table are not considered.
    pub fn claim_next(&self, now: u64, lease: Duration) -> Result<Option<Job>> {
        let mut blocked = HashSet::new();

        for entry in self.pending.iter() {
            let (key, table_bytes) = entry?;
            let table_id = decode_u64(&table_bytes)?;
            if blocked.contains(&table_id) {
                continue;
            }

            let Some(current) = self.records.get(&key)? else {
                self.pending.remove(&key)?;
                continue;
            };
            let job = Job::from_bytes(&current)?;
            if job.status.is_terminal() {
                self.pending.remove(&key)?;
                continue;
            }
            blocked.insert(table_id);

            if !job.status.is_claimable() || job.run_after > now {
                continue;
            }

            let mut claimed = job;
            claimed.status = JobStatus::Running;
            claimed.attempts += 1;
            claimed.lease_expires_at = Some(now.saturating_add(micros(lease)));
            claimed.updated_at = now;

            let swapped = self
                .records
                .compare_and_swap(&key, Some(current), Some(claimed.to_bytes()?))?;
            if swapped.is_ok() {
                tracing::debug!(
                    job_id = claimed.id,
                    table_id,
                    attempt = claimed.attempts,
                    "claimed job"
                );
                return Ok(Some(claimed));
            }
            // Another worker claimed it first; the table stays blocked.
        }

        Ok(None)
    }

    /// Mark a running job as succeeded.
    ///
    /// Returns false when the job is no longer running under `attempt`
    /// (its lease expired and it was reclaimed or failed).
    pub fn mark_succeeded(&self, id: u64, attempt: u32, outcome: JobOutcome, now: u64) -> Result<bool> {
        self.finish(id, attempt, now, |job| {
            job.status = JobStatus::Succeeded;
            job.outcome = Some(outcome);
            job.last_error = None;
        })
    }

    /// Record a failure of a running job.
    ///
    /// `status` is `FailedRetryable` (claimable again at `run_after`) or
    /// `FailedTerminal`. Same fencing as [`JobQueue::mark_succeeded`].
    pub fn fail(
        &self,
        id: u64,
        attempt: u32,
        status: JobStatus,
        error: &str,
        run_after: u64,
        now: u64,
    ) -> Result<bool> {
        if !matches!(status, JobStatus::FailedRetryable | JobStatus::FailedTerminal) {
            return Err(Error::Validation(format!("{status} is not a failure status")));
        }
        self.finish(id, attempt, now, |job| {
            job.status = status;
            job.last_error = Some(error.to_string());
            job.run_after = run_after;
        })
    }

    fn finish<F>(&self, id: u64, attempt: u32, now: u64, f: F) -> Result<bool>
    where
        F: Fn(&mut Job),
    {
        let key = id.to_be_bytes();
        let accepted = (&self.records, &self.pending).transaction(
            |(records, pending)| -> ConflictableTransactionResult<bool, Error> {
                let Some(bytes) = records.get(&key[..])? else {
                    return Ok(false);
                };
                let mut job = Job::from_bytes(&bytes).map_err(abort)?;
                if job.status != JobStatus::Running || job.attempts != attempt {
                    return Ok(false);
                }
                f(&mut job);
                job.lease_expires_at = None;
                job.updated_at = now;
                records.insert(&key[..], job.to_bytes().map_err(abort)?)?;
                if job.status.is_terminal() {
                    pending.remove(&key[..])?;
                }
                Ok(true)
            },
        )?;
        Ok(accepted)
    }

    /// Running jobs whose lease has expired.
    pub fn expired_leases(&self, now: u64) -> Result<Vec<Job>> {
        let mut expired = Vec::new();
        for entry in self.pending.iter() {
            let (key, _) = entry?;
            if let Some(bytes) = self.records.get(&key)? {
                let job = Job::from_bytes(&bytes)?;
                if job.lease_expired(now) {
                    expired.push(job);
                }
            }
        }
        Ok(expired)
    }

    /// All jobs of a table, oldest first.
    pub fn jobs_for_table(&self, table_id: u64) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in self.records.iter() {
            let (_, bytes) = entry?;
            let job = Job::from_bytes(&bytes)?;
            if job.table_id == table_id {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Number of jobs that have not reached a terminal state.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.records.flush()?;
        self.pending.flush()?;
        Ok(())
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization(format!("invalid id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}
