//! Core error types.

use sled::transaction::TransactionError;
use thiserror::Error;

/// How the job orchestrator should treat a failed schema operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient: retry with backoff.
    Retryable,
    /// Permanent: retrying cannot change the outcome.
    Terminal,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Retryable => write!(f, "retryable"),
            FailureClass::Terminal => write!(f, "terminal"),
        }
    }
}

/// Failure while applying a schema change to the physical engine.
#[derive(Debug, Clone, Error)]
pub enum SchemaApplyError {
    /// Transient engine or connection failure.
    #[error("transient schema failure: {0}")]
    Retryable(String),

    /// Semantic impossibility, such as data that cannot be coerced.
    #[error("schema change rejected: {0}")]
    Terminal(String),
}

/// Core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed metadata or record input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced table, field, or record is absent.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Kind of entity that was looked up.
        entity: &'static str,
        /// Identifier used for the lookup.
        key: String,
    },

    /// Name already taken, or duplicate data blocking a uniqueness request.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Physical schema application failed.
    #[error(transparent)]
    SchemaApply(#[from] SchemaApplyError),

    /// Metadata storage error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Filesystem or thread spawning error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Build a not-found error.
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Error::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Classify this error for the job orchestrator.
    ///
    /// Only transient engine failures and metadata storage hiccups are worth retrying.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::SchemaApply(SchemaApplyError::Retryable(_)) | Error::Storage(_) => {
                FailureClass::Retryable
            }
            _ => FailureClass::Terminal,
        }
    }

    /// Check whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        self.failure_class() == FailureClass::Retryable
    }
}

impl From<TransactionError<Error>> for Error {
    fn from(err: TransactionError<Error>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => Error::Storage(e),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            Error::Conflict("dup".into()).failure_class(),
            FailureClass::Terminal
        );
        assert_eq!(
            Error::SchemaApply(SchemaApplyError::Terminal("abc".into())).failure_class(),
            FailureClass::Terminal
        );
        assert_eq!(
            Error::SchemaApply(SchemaApplyError::Retryable("busy".into())).failure_class(),
            FailureClass::Retryable
        );
        assert!(!Error::not_found("table", 7).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::not_found("field", "email");
        assert_eq!(err.to_string(), "field not found: email");
    }
}
