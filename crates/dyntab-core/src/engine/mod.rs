//! Physical engine adapters.
//!
//! An [`Engine`] exposes dialect-specific DDL primitives, schema introspection
//! and the handful of row operations the record layer needs. Engines know
//! nothing about table or field metadata; they work on physical names only.

mod sqlite;

#[cfg(feature = "postgres")]
mod postgres;

pub use sqlite::SqliteEngine;

#[cfg(feature = "postgres")]
pub use postgres::PostgresEngine;

use crate::error::{Error, SchemaApplyError};
use crate::types::{CoercionError, FieldType, SqlValue};
use thiserror::Error;

/// Column values keyed by column name, in column order.
pub type Row = Vec<(String, SqlValue)>;

/// Definition of a user column to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Field type; the engine picks the declared SQL type.
    pub field_type: FieldType,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default applied to existing and future rows.
    pub default: Option<SqlValue>,
}

impl ColumnDef {
    /// A nullable column without default.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            default: None,
        }
    }

    /// NOT NULL, backfilled with the type's default value.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self.default = Some(self.field_type.backfill_default());
        self
    }
}

/// A physical column as reported by introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared SQL type.
    pub declared_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default expression as SQL text.
    pub default: Option<String>,
    /// Part of the primary key.
    pub primary_key: bool,
}

/// A physical index as reported by introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed columns in order.
    pub columns: Vec<String>,
    /// Unique index.
    pub unique: bool,
    /// Backs the primary key.
    pub primary: bool,
}

/// Filter comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Exact match.
    Eq,
    /// Substring match on the textual form of the value.
    Contains,
}

/// A filter on one column.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    /// Column to compare.
    pub column: String,
    /// Comparison.
    pub op: FilterOp,
    /// Operand.
    pub value: SqlValue,
}

impl RowFilter {
    /// Equality filter.
    pub fn eq(column: impl Into<String>, value: SqlValue) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value,
        }
    }

    /// Substring filter.
    pub fn contains(column: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Contains,
            value: SqlValue::Text(needle.into()),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    #[default]
    Desc,
}

/// A row selection. Column names must already be validated by the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectSpec {
    /// Columns to return.
    pub columns: Vec<String>,
    /// Conjunctive filters.
    pub filters: Vec<RowFilter>,
    /// Sort column and direction.
    pub sort: Option<(String, SortDirection)>,
    /// Maximum rows.
    pub limit: Option<u64>,
    /// Rows to skip.
    pub offset: u64,
}

/// Errors raised by engine adapters.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Physical table does not exist.
    #[error("table {0} does not exist")]
    TableNotFound(String),

    /// Column does not exist.
    #[error("column {column} does not exist on {table}")]
    ColumnNotFound {
        /// Physical table.
        table: String,
        /// Column name.
        column: String,
    },

    /// Column already exists.
    #[error("column {column} already exists on {table}")]
    ColumnExists {
        /// Physical table.
        table: String,
        /// Column name.
        column: String,
    },

    /// Existing data blocks a unique index.
    #[error("column {column} of {table} has {groups} duplicated value(s)")]
    DuplicateValues {
        /// Physical table.
        table: String,
        /// Column name.
        column: String,
        /// Number of values that occur more than once.
        groups: u64,
    },

    /// Existing data cannot be converted to the target type.
    #[error("column {column} of {table}: {source}")]
    Coercion {
        /// Physical table.
        table: String,
        /// Column name.
        column: String,
        /// Offending value.
        #[source]
        source: CoercionError,
    },

    /// A row write left a NOT NULL column empty.
    #[error("{}", constraint_message("can't be blank", .column))]
    NotNullViolation {
        /// Offending column, when the engine reported it.
        column: Option<String>,
    },

    /// A row write duplicated a unique value.
    #[error("{}", constraint_message("has already been taken", .column))]
    UniqueViolation {
        /// Offending column, when the engine reported it.
        column: Option<String>,
    },

    /// The database is locked or busy.
    #[error("database busy: {0}")]
    Busy(String),

    /// The connection failed or the database is unreachable.
    #[error("connection error: {0}")]
    Connection(String),

    /// The engine rejected a statement for a reason retrying cannot change
    /// (malformed SQL, type mismatch, read-only database).
    #[error("statement rejected: {0}")]
    Rejected(String),

    /// Any other engine error.
    #[error("engine error: {0}")]
    Other(String),
}

fn constraint_message(problem: &str, column: &Option<String>) -> String {
    match column {
        Some(column) => format!("{column} {problem}"),
        None => format!("a value {problem}"),
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::TableNotFound(table) => Error::not_found("physical table", table),
            EngineError::ColumnNotFound { table, column } => {
                Error::not_found("column", format!("{table}.{column}"))
            }
            EngineError::ColumnExists { .. } | EngineError::DuplicateValues { .. } => {
                Error::Conflict(err.to_string())
            }
            EngineError::Coercion { .. } => {
                Error::SchemaApply(SchemaApplyError::Terminal(err.to_string()))
            }
            EngineError::NotNullViolation { .. } => Error::Validation(err.to_string()),
            EngineError::UniqueViolation { .. } => Error::Conflict(err.to_string()),
            EngineError::Rejected(_) => {
                Error::SchemaApply(SchemaApplyError::Terminal(err.to_string()))
            }
            EngineError::Busy(_) | EngineError::Connection(_) | EngineError::Other(_) => {
                Error::SchemaApply(SchemaApplyError::Retryable(err.to_string()))
            }
        }
    }
}

/// Dialect-specific physical schema operations.
///
/// Every physical table carries the system columns `id` (auto-increment
/// primary key), `created_at` and `updated_at`.
pub trait Engine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Whether `change_column_type` is a native ALTER rather than a rebuild.
    fn supports_alter_column_type(&self) -> bool;

    /// Declared SQL type used for a field type.
    fn declared_type(&self, field_type: FieldType) -> &'static str;

    /// Whether an existing column already has the physical type used for `field_type`.
    fn column_matches_type(&self, column: &ColumnInfo, field_type: FieldType) -> bool {
        column
            .declared_type
            .eq_ignore_ascii_case(self.declared_type(field_type))
    }

    /// Names of all tables.
    fn list_tables(&self) -> EngineResult<Vec<String>>;

    /// Check if a table exists.
    fn table_exists(&self, table: &str) -> EngineResult<bool>;

    /// Columns of a table in ordinal order.
    fn describe_columns(&self, table: &str) -> EngineResult<Vec<ColumnInfo>>;

    /// Indexes of a table.
    fn describe_indexes(&self, table: &str) -> EngineResult<Vec<IndexInfo>>;

    /// Check if a column exists.
    fn column_exists(&self, table: &str, column: &str) -> EngineResult<bool> {
        Ok(self
            .describe_columns(table)?
            .iter()
            .any(|c| c.name == column))
    }

    /// Check if a single-column unique index covers `column`.
    fn has_unique_index(&self, table: &str, column: &str) -> EngineResult<bool> {
        Ok(self
            .describe_indexes(table)?
            .iter()
            .any(|i| i.unique && !i.primary && i.columns.len() == 1 && i.columns[0] == column))
    }

    /// Create a table with the system columns plus `columns`.
    fn create_table(&self, table: &str, columns: &[ColumnDef]) -> EngineResult<()>;

    /// Drop a table if it exists.
    fn drop_table(&self, table: &str) -> EngineResult<()>;

    /// Add a column.
    fn add_column(&self, table: &str, column: &ColumnDef) -> EngineResult<()>;

    /// Drop a column.
    fn drop_column(&self, table: &str, column: &str) -> EngineResult<()>;

    /// Rename a column.
    fn rename_column(&self, table: &str, old: &str, new: &str) -> EngineResult<()>;

    /// Change a column's type, converting existing values.
    ///
    /// A value that cannot be converted fails with [`EngineError::Coercion`]
    /// and leaves the table unchanged.
    fn change_column_type(&self, table: &str, column: &str, new_type: FieldType) -> EngineResult<()>;

    /// Number of non-NULL values of `column` that occur more than once.
    fn find_duplicates(&self, table: &str, column: &str) -> EngineResult<u64>;

    /// Create a unique index on `column`.
    ///
    /// Existing duplicates fail with [`EngineError::DuplicateValues`] before
    /// any schema change.
    fn add_unique_index(&self, table: &str, column: &str) -> EngineResult<()>;

    /// Drop every single-column unique index on `column`. Returns whether any existed.
    fn remove_unique_index(&self, table: &str, column: &str) -> EngineResult<bool>;

    /// Select rows.
    fn select_rows(&self, table: &str, spec: &SelectSpec) -> EngineResult<Vec<Row>>;

    /// Count rows matching the filters.
    fn count_rows(&self, table: &str, filters: &[RowFilter]) -> EngineResult<u64>;

    /// Insert a row, returning its id.
    fn insert_row(&self, table: &str, values: &Row) -> EngineResult<i64>;

    /// Update a row by id. Returns false if no row matched.
    fn update_row(&self, table: &str, id: i64, values: &Row) -> EngineResult<bool>;

    /// Delete a row by id. Returns false if no row matched.
    fn delete_row(&self, table: &str, id: i64) -> EngineResult<bool>;
}

/// Extract the column from an engine constraint message.
///
/// Understands `NOT NULL constraint failed: dyn_1.email`, `UNIQUE constraint
/// failed: dyn_1.email` and messages naming a `uidx_<table>_<column>` index.
pub(crate) fn constraint_column(message: &str, table: &str) -> Option<String> {
    if let Some((_, rest)) = message.split_once("constraint failed: ") {
        let first = rest.split(',').next().unwrap_or(rest).trim();
        let column = first.rsplit('.').next().unwrap_or(first);
        if !column.is_empty() {
            return Some(column.to_string());
        }
    }
    message
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .find_map(|word| crate::naming::column_from_index_name(word, table))
        .map(String::from)
}
