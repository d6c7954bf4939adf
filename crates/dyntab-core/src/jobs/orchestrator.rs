//! Executes queued schema jobs against the engine and records their outcome.

use super::job::{Job, JobOperation, JobOutcome, JobStatus};
use super::queue::JobQueue;
use crate::catalog::{MetadataStore, SyncFailure};
use crate::clock::current_timestamp;
use crate::config::OrchestratorConfig;
use crate::ddl::DdlService;
use crate::error::{Error, FailureClass, Result};
use crate::naming;

/// Summary of one executed (or recovered) job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    /// Job id.
    pub job_id: u64,
    /// Owning table.
    pub table_id: u64,
    /// Operation kind.
    pub operation: &'static str,
    /// Attempt number that produced this report.
    pub attempt: u32,
    /// Status after the attempt.
    pub status: JobStatus,
    /// Outcome when the job succeeded.
    pub outcome: Option<JobOutcome>,
    /// Failure message when it did not.
    pub error: Option<String>,
    /// False when the result arrived after the lease was lost and was dropped.
    pub recorded: bool,
}

/// Claims jobs and applies them through the DDL service.
pub struct JobOrchestrator {
    catalog: MetadataStore,
    queue: JobQueue,
    ddl: DdlService,
    config: OrchestratorConfig,
}

fn micros(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl JobOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        catalog: MetadataStore,
        queue: JobQueue,
        ddl: DdlService,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            catalog,
            queue,
            ddl,
            config,
        }
    }

    /// Orchestrator configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Recover expired leases, then claim and run at most one job.
    pub fn run_once(&self) -> Result<Option<JobReport>> {
        self.run_once_at(current_timestamp())
    }

    /// [`JobOrchestrator::run_once`] at an explicit time.
    pub fn run_once_at(&self, now: u64) -> Result<Option<JobReport>> {
        self.recover_expired(now)?;
        match self.queue.claim_next(now, self.config.max_job_duration)? {
            Some(job) => self.execute(job, now).map(Some),
            None => Ok(None),
        }
    }

    /// Run jobs until nothing is claimable right now.
    ///
    /// Jobs backing off after a retryable failure are left for later.
    pub fn run_until_idle(&self) -> Result<Vec<JobReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.run_once()? {
            reports.push(report);
        }
        Ok(reports)
    }

    /// Fail running jobs whose lease has expired so they stop blocking their table.
    pub fn recover_expired(&self, now: u64) -> Result<Vec<JobReport>> {
        let mut reports = Vec::new();
        for job in self.queue.expired_leases(now)? {
            tracing::warn!(job_id = job.id, table_id = job.table_id, attempt = job.attempts, "job lease expired");
            let message = format!(
                "lease expired after {}s",
                self.config.max_job_duration.as_secs()
            );
            reports.push(self.record_failure(&job, FailureClass::Retryable, message, now)?);
        }
        Ok(reports)
    }

    fn execute(&self, job: Job, now: u64) -> Result<JobReport> {
        let physical = naming::physical_table_name(job.table_id);
        tracing::info!(
            job_id = job.id,
            table_id = job.table_id,
            operation = %job.operation,
            attempt = job.attempts,
            "running schema job"
        );

        match self.apply(&job, &physical) {
            Ok(outcome) => self.record_success(&job, outcome, now),
            Err(e) => {
                let class = e.failure_class();
                self.record_failure(&job, class, e.to_string(), now)
            }
        }
    }

    /// Apply the operation. Metadata for field jobs is re-read here; a job
    /// whose field or table is gone completes as `Skipped`.
    fn apply(&self, job: &Job, physical: &str) -> Result<JobOutcome> {
        match &job.operation {
            JobOperation::EnsureTable => {
                if self.catalog.get_table(job.table_id)?.is_none() {
                    return Ok(JobOutcome::Skipped);
                }
                Ok(self.ddl.ensure_table_exists(physical)?.into())
            }
            JobOperation::AddField { field_id, column } => {
                let Some(mut field) = self.catalog.get_field(*field_id)? else {
                    return Ok(JobOutcome::Skipped);
                };
                field.name = column.clone();
                Ok(self.ddl.add_field(physical, &field)?.into())
            }
            JobOperation::RemoveField { column, .. } => {
                Ok(self.ddl.remove_field(physical, column)?.into())
            }
            JobOperation::RenameField { field_id, from, to } => {
                match self.ddl.rename_field(physical, from, to) {
                    Err(Error::NotFound { .. }) if self.catalog.get_field(*field_id)?.is_none() => {
                        Ok(JobOutcome::Skipped)
                    }
                    result => Ok(result?.into()),
                }
            }
            JobOperation::ChangeFieldType {
                field_id,
                column,
                new_type,
            } => {
                if self.catalog.get_field(*field_id)?.is_none() {
                    return Ok(JobOutcome::Skipped);
                }
                Ok(self.ddl.change_field_type(physical, column, *new_type)?.into())
            }
            JobOperation::ChangeUniqueConstraint {
                field_id,
                column,
                unique,
            } => {
                if self.catalog.get_field(*field_id)?.is_none() {
                    return Ok(JobOutcome::Skipped);
                }
                Ok(self.ddl.change_unique_constraint(physical, column, *unique)?.into())
            }
            JobOperation::DropTable { physical_table } => {
                Ok(self.ddl.drop_table(physical_table)?.into())
            }
        }
    }

    fn record_success(&self, job: &Job, outcome: JobOutcome, now: u64) -> Result<JobReport> {
        let recorded = self.queue.mark_succeeded(job.id, job.attempts, outcome, now)?;
        if !recorded {
            tracing::warn!(job_id = job.id, attempt = job.attempts, "discarding late job completion");
            return Ok(self.report(job, JobStatus::Succeeded, Some(outcome), None, false));
        }

        if outcome != JobOutcome::Skipped {
            self.commit_metadata(job)?;
            match self.catalog.bump_generation(job.table_id) {
                Ok(_) | Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(job_id = job.id, table_id = job.table_id, outcome = %outcome, "schema job succeeded");
        Ok(self.report(job, JobStatus::Succeeded, Some(outcome), None, true))
    }

    /// Write the state a successful job establishes and clear any recorded failure.
    fn commit_metadata(&self, job: &Job) -> Result<()> {
        match &job.operation {
            JobOperation::ChangeFieldType {
                field_id, new_type, ..
            } => {
                let new_type = *new_type;
                self.catalog.modify_field(*field_id, |f| {
                    f.field_type = new_type;
                    f.sync_failure = None;
                })?;
            }
            JobOperation::ChangeUniqueConstraint {
                field_id, unique, ..
            } => {
                let unique = *unique;
                self.catalog.modify_field(*field_id, |f| {
                    f.unique = unique;
                    f.sync_failure = None;
                })?;
            }
            JobOperation::AddField { field_id, .. } | JobOperation::RenameField { field_id, .. } => {
                self.catalog.clear_field_sync_failure(*field_id)?;
            }
            JobOperation::EnsureTable => {
                self.catalog.clear_table_sync_failure(job.table_id)?;
            }
            JobOperation::RemoveField { .. } | JobOperation::DropTable { .. } => {}
        }
        Ok(())
    }

    fn record_failure(
        &self,
        job: &Job,
        class: FailureClass,
        message: String,
        now: u64,
    ) -> Result<JobReport> {
        let retry = class == FailureClass::Retryable && job.attempts < self.config.max_attempts;
        let (status, run_after) = if retry {
            let delay = self.config.backoff_for(job.attempts);
            (JobStatus::FailedRetryable, now.saturating_add(micros(delay)))
        } else {
            (JobStatus::FailedTerminal, now)
        };

        let recorded = self
            .queue
            .fail(job.id, job.attempts, status, &message, run_after, now)?;
        if !recorded {
            tracing::warn!(job_id = job.id, attempt = job.attempts, error = %message, "discarding late job failure");
            return Ok(self.report(job, status, None, Some(message), false));
        }

        if retry {
            tracing::warn!(
                job_id = job.id,
                table_id = job.table_id,
                operation = %job.operation,
                attempt = job.attempts,
                error = %message,
                "schema job failed, will retry"
            );
        } else {
            tracing::error!(
                job_id = job.id,
                table_id = job.table_id,
                operation = %job.operation,
                attempt = job.attempts,
                class = %class,
                error = %message,
                "schema job failed"
            );
            self.mark_out_of_sync(job, &message, now)?;
        }
        Ok(self.report(job, status, None, Some(message), true))
    }

    fn mark_out_of_sync(&self, job: &Job, reason: &str, now: u64) -> Result<()> {
        let failure = SyncFailure {
            job_id: job.id,
            reason: reason.to_string(),
            failed_at: now,
        };
        if let Some(field_id) = job.operation.field_id() {
            if self.catalog.mark_field_out_of_sync(field_id, failure.clone())? {
                return Ok(());
            }
        }
        self.catalog.mark_table_out_of_sync(job.table_id, failure)?;
        Ok(())
    }

    fn report(
        &self,
        job: &Job,
        status: JobStatus,
        outcome: Option<JobOutcome>,
        error: Option<String>,
        recorded: bool,
    ) -> JobReport {
        JobReport {
            job_id: job.id,
            table_id: job.table_id,
            operation: job.operation.kind(),
            attempt: job.attempts,
            status,
            outcome,
            error,
            recorded,
        }
    }
}
