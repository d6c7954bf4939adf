//! Schema job records and their state machine.

use crate::codec::impl_rkyv_codec;
use crate::ddl::DdlOutcome;
use crate::types::FieldType;
use rkyv::{Archive, Deserialize, Serialize};

/// A physical schema change to apply.
///
/// Column names are captured when the job is enqueued. Jobs of a table run
/// in enqueue order, so the name in the payload is the physical name at the
/// time the job runs.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum JobOperation {
    /// Create the physical table.
    EnsureTable,
    /// Add a field's column.
    AddField {
        /// Field to add.
        field_id: u64,
        /// Column name.
        column: String,
    },
    /// Drop a column. Runs without metadata; the field is already deleted.
    RemoveField {
        /// Deleted field.
        field_id: u64,
        /// Column to drop.
        column: String,
    },
    /// Rename a column.
    RenameField {
        /// Renamed field.
        field_id: u64,
        /// Current physical name.
        from: String,
        /// New name.
        to: String,
    },
    /// Convert a column to a new type. Metadata follows on success.
    ChangeFieldType {
        /// Field to convert.
        field_id: u64,
        /// Column name.
        column: String,
        /// Desired type.
        new_type: FieldType,
    },
    /// Add or remove a column's unique index. Metadata follows on success.
    ChangeUniqueConstraint {
        /// Field to change.
        field_id: u64,
        /// Column name.
        column: String,
        /// Desired uniqueness.
        unique: bool,
    },
    /// Drop the physical table. Runs without metadata.
    DropTable {
        /// Physical table name.
        physical_table: String,
    },
}

impl JobOperation {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobOperation::EnsureTable => "ensure_table",
            JobOperation::AddField { .. } => "add_field",
            JobOperation::RemoveField { .. } => "remove_field",
            JobOperation::RenameField { .. } => "rename_field",
            JobOperation::ChangeFieldType { .. } => "change_field_type",
            JobOperation::ChangeUniqueConstraint { .. } => "change_unique_constraint",
            JobOperation::DropTable { .. } => "drop_table",
        }
    }

    /// Field the operation targets, if any.
    pub fn field_id(&self) -> Option<u64> {
        match self {
            JobOperation::AddField { field_id, .. }
            | JobOperation::RemoveField { field_id, .. }
            | JobOperation::RenameField { field_id, .. }
            | JobOperation::ChangeFieldType { field_id, .. }
            | JobOperation::ChangeUniqueConstraint { field_id, .. } => Some(*field_id),
            JobOperation::EnsureTable | JobOperation::DropTable { .. } => None,
        }
    }
}

impl std::fmt::Display for JobOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// Lifecycle state of a job.
///
/// `Enqueued -> Running -> {Succeeded, FailedRetryable, FailedTerminal}`,
/// and `FailedRetryable -> Running` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting to be claimed.
    Enqueued,
    /// Claimed by a worker.
    Running,
    /// Completed.
    Succeeded,
    /// Failed; will be retried after its backoff.
    FailedRetryable,
    /// Failed permanently.
    FailedTerminal,
}

impl JobStatus {
    /// Check if the job will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::FailedTerminal)
    }

    /// Check if a worker may claim the job (subject to ordering and backoff).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Enqueued | JobStatus::FailedRetryable)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Enqueued => write!(f, "enqueued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::FailedRetryable => write!(f, "failed_retryable"),
            JobStatus::FailedTerminal => write!(f, "failed_terminal"),
        }
    }
}

/// What a successful job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum JobOutcome {
    /// The physical schema changed.
    Applied,
    /// The physical schema already matched.
    AlreadyApplied,
    /// The target metadata no longer exists; nothing to do.
    Skipped,
}

impl From<DdlOutcome> for JobOutcome {
    fn from(outcome: DdlOutcome) -> Self {
        match outcome {
            DdlOutcome::Applied => JobOutcome::Applied,
            DdlOutcome::AlreadyApplied => JobOutcome::AlreadyApplied,
        }
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Applied => write!(f, "applied"),
            JobOutcome::AlreadyApplied => write!(f, "already_applied"),
            JobOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// A durable schema job.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Job {
    /// Monotonic id; defines per-table order.
    pub id: u64,
    /// Table the job belongs to.
    pub table_id: u64,
    /// What to do.
    pub operation: JobOperation,
    /// Current state.
    pub status: JobStatus,
    /// Number of claims so far. Also fences late completions.
    pub attempts: u32,
    /// Earliest claim time (microseconds since epoch).
    pub run_after: u64,
    /// Lease expiry of the current claim.
    pub lease_expires_at: Option<u64>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Result of a successful run.
    pub outcome: Option<JobOutcome>,
    /// Enqueue time.
    pub created_at: u64,
    /// Last state change.
    pub updated_at: u64,
}

impl Job {
    /// Create an enqueued job.
    pub fn new(id: u64, table_id: u64, operation: JobOperation, now: u64) -> Self {
        Self {
            id,
            table_id,
            operation,
            status: JobStatus::Enqueued,
            attempts: 0,
            run_after: now,
            lease_expires_at: None,
            last_error: None,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the current lease has expired.
    pub fn lease_expired(&self, now: u64) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|t| t <= now)
    }
}

impl_rkyv_codec!(Job);
