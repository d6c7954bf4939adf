//! DDL execution: one metadata-level change to one or more engine calls.
//!
//! Every operation pre-checks the physical schema so it can be retried after a
//! partial failure or a duplicate delivery. Expected conditions (already
//! applied, duplicate data) are detected explicitly, never by parsing engine
//! error strings.

use crate::catalog::FieldDef;
use crate::engine::{ColumnDef, Engine, EngineError};
use crate::error::{Error, Result};
use crate::naming;
use crate::types::FieldType;
use std::sync::Arc;

/// Result of an idempotent DDL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlOutcome {
    /// The physical schema was changed.
    Applied,
    /// The physical schema already matched; nothing was done.
    AlreadyApplied,
}

impl DdlOutcome {
    /// Check if the physical schema changed.
    pub fn changed(&self) -> bool {
        matches!(self, DdlOutcome::Applied)
    }
}

impl std::fmt::Display for DdlOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DdlOutcome::Applied => write!(f, "applied"),
            DdlOutcome::AlreadyApplied => write!(f, "already_applied"),
        }
    }
}

/// Applies schema changes to physical tables.
#[derive(Clone)]
pub struct DdlService {
    engine: Arc<dyn Engine>,
}

impl DdlService {
    /// Create a service over an engine.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Create the physical table with only system columns if it is absent.
    pub fn ensure_table_exists(&self, physical: &str) -> Result<DdlOutcome> {
        if self.engine.table_exists(physical)? {
            return Ok(DdlOutcome::AlreadyApplied);
        }
        self.engine.create_table(physical, &[])?;
        tracing::info!(table = physical, "created table");
        Ok(DdlOutcome::Applied)
    }

    /// Drop the physical table if present.
    pub fn drop_table(&self, physical: &str) -> Result<DdlOutcome> {
        if !self.engine.table_exists(physical)? {
            return Ok(DdlOutcome::AlreadyApplied);
        }
        self.engine.drop_table(physical)?;
        tracing::info!(table = physical, "dropped table");
        Ok(DdlOutcome::Applied)
    }

    /// Add the column for a field.
    ///
    /// Required fields are added NOT NULL with the type's default so existing
    /// rows are backfilled. Unique fields get their index afterwards; if
    /// existing data is duplicated the just-added column is dropped again.
    pub fn add_field(&self, physical: &str, field: &FieldDef) -> Result<DdlOutcome> {
        if !self.engine.table_exists(physical)? {
            return Err(Error::not_found("physical table", physical));
        }

        if self.engine.column_exists(physical, &field.name)? {
            if field.unique && !self.engine.has_unique_index(physical, &field.name)? {
                self.engine.add_unique_index(physical, &field.name)?;
                return Ok(DdlOutcome::Applied);
            }
            return Ok(DdlOutcome::AlreadyApplied);
        }

        let mut column = ColumnDef::new(&field.name, field.field_type);
        if field.required {
            column = column.not_null();
        }
        self.engine.add_column(physical, &column)?;
        tracing::info!(table = physical, column = %field.name, field_type = %field.field_type, "added column");

        if field.unique {
            match self.engine.add_unique_index(physical, &field.name) {
                Ok(()) => {}
                Err(e @ EngineError::DuplicateValues { .. }) => {
                    self.engine.drop_column(physical, &field.name)?;
                    tracing::warn!(table = physical, column = %field.name, "dropped new column: existing rows are not unique");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(DdlOutcome::Applied)
    }

    /// Drop a column and its unique index. An absent column or table is success.
    pub fn remove_field(&self, physical: &str, column: &str) -> Result<DdlOutcome> {
        if !self.engine.table_exists(physical)? || !self.engine.column_exists(physical, column)? {
            return Ok(DdlOutcome::AlreadyApplied);
        }
        self.engine.remove_unique_index(physical, column)?;
        self.engine.drop_column(physical, column)?;
        tracing::info!(table = physical, column, "removed column");
        Ok(DdlOutcome::Applied)
    }

    /// Rename a column.
    ///
    /// `old` must exist and `new` must not. Finding only `new` means the
    /// rename already happened.
    pub fn rename_field(&self, physical: &str, old: &str, new: &str) -> Result<DdlOutcome> {
        naming::validate_field_name(new)?;
        let old_exists = self.engine.column_exists(physical, old)?;
        if old == new {
            return if old_exists {
                Ok(DdlOutcome::AlreadyApplied)
            } else {
                Err(Error::not_found("column", format!("{physical}.{old}")))
            };
        }
        let new_exists = self.engine.column_exists(physical, new)?;
        match (old_exists, new_exists) {
            (true, false) => {
                self.engine.rename_column(physical, old, new)?;
                tracing::info!(table = physical, from = old, to = new, "renamed column");
                Ok(DdlOutcome::Applied)
            }
            (false, true) => Ok(DdlOutcome::AlreadyApplied),
            (true, true) => Err(Error::Conflict(format!(
                "cannot rename {old} to {new}: column {new} already exists on {physical}"
            ))),
            (false, false) => Err(Error::not_found("column", format!("{physical}.{old}"))),
        }
    }

    /// Convert a column to a new type.
    ///
    /// Values that cannot be converted fail terminally and leave the table unchanged.
    pub fn change_field_type(
        &self,
        physical: &str,
        column: &str,
        new_type: FieldType,
    ) -> Result<DdlOutcome> {
        let info = self
            .engine
            .describe_columns(physical)?
            .into_iter()
            .find(|c| c.name == column)
            .ok_or_else(|| Error::not_found("column", format!("{physical}.{column}")))?;
        if self.engine.column_matches_type(&info, new_type) {
            return Ok(DdlOutcome::AlreadyApplied);
        }
        self.engine.change_column_type(physical, column, new_type)?;
        tracing::info!(
            table = physical,
            column,
            from = %info.declared_type,
            to = self.engine.declared_type(new_type),
            rebuild = !self.engine.supports_alter_column_type(),
            "changed column type"
        );
        Ok(DdlOutcome::Applied)
    }

    /// Make a column's uniqueness match `want_unique`.
    pub fn change_unique_constraint(
        &self,
        physical: &str,
        column: &str,
        want_unique: bool,
    ) -> Result<DdlOutcome> {
        if !self.engine.column_exists(physical, column)? {
            return Err(Error::not_found("column", format!("{physical}.{column}")));
        }
        if self.engine.has_unique_index(physical, column)? == want_unique {
            return Ok(DdlOutcome::AlreadyApplied);
        }
        if want_unique {
            self.engine.add_unique_index(physical, column)?;
        } else {
            self.engine.remove_unique_index(physical, column)?;
        }
        tracing::info!(table = physical, column, unique = want_unique, "changed unique constraint");
        Ok(DdlOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SelectSpec, SqliteEngine};
    use crate::error::SchemaApplyError;
    use crate::types::SqlValue;

    const PHYSICAL: &str = "dyn_1";

    fn service() -> DdlService {
        DdlService::new(Arc::new(SqliteEngine::in_memory().unwrap()))
    }

    fn field(name: &str, field_type: FieldType) -> FieldDef {
        FieldDef {
            id: 1,
            table_id: 1,
            name: name.to_string(),
            field_type,
            required: false,
            unique: false,
            sync_failure: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn insert(ddl: &DdlService, values: Vec<(&str, SqlValue)>) {
        let mut row = vec![
            ("created_at".to_string(), SqlValue::Text("2025-01-01 00:00:00".into())),
            ("updated_at".to_string(), SqlValue::Text("2025-01-01 00:00:00".into())),
        ];
        row.extend(values.into_iter().map(|(c, v)| (c.to_string(), v)));
        ddl.engine().insert_row(PHYSICAL, &row).unwrap();
    }

    fn columns(ddl: &DdlService) -> Vec<String> {
        ddl.engine()
            .describe_columns(PHYSICAL)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[test]
    fn test_ensure_table_twice() {
        let ddl = service();
        assert_eq!(ddl.ensure_table_exists(PHYSICAL).unwrap(), DdlOutcome::Applied);
        assert_eq!(
            ddl.ensure_table_exists(PHYSICAL).unwrap(),
            DdlOutcome::AlreadyApplied
        );
        assert_eq!(columns(&ddl), vec!["id", "created_at", "updated_at"]);
    }

    #[test]
    fn test_add_field_is_idempotent() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        let name = field("name", FieldType::String);
        assert_eq!(ddl.add_field(PHYSICAL, &name).unwrap(), DdlOutcome::Applied);
        assert_eq!(
            ddl.add_field(PHYSICAL, &name).unwrap(),
            DdlOutcome::AlreadyApplied
        );
    }

    #[test]
    fn test_add_field_requires_table() {
        let ddl = service();
        let result = ddl.add_field(PHYSICAL, &field("name", FieldType::String));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_add_required_unique_field_on_populated_table_rolls_back() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        insert(&ddl, vec![]);
        insert(&ddl, vec![]);

        let mut sku = field("sku", FieldType::String);
        sku.required = true;
        sku.unique = true;
        let result = ddl.add_field(PHYSICAL, &sku);
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert!(!ddl.engine().column_exists(PHYSICAL, "sku").unwrap());
    }

    #[test]
    fn test_required_field_backfills_default() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        insert(&ddl, vec![]);

        let mut active = field("active", FieldType::Boolean);
        active.required = true;
        ddl.add_field(PHYSICAL, &active).unwrap();

        let rows = ddl
            .engine()
            .select_rows(
                PHYSICAL,
                &SelectSpec {
                    columns: vec!["active".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rows[0][0].1, SqlValue::Integer(0));
    }

    #[test]
    fn test_remove_field_absent_is_noop() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        assert_eq!(
            ddl.remove_field(PHYSICAL, "never_created").unwrap(),
            DdlOutcome::AlreadyApplied
        );
        assert_eq!(
            ddl.remove_field("dyn_404", "anything").unwrap(),
            DdlOutcome::AlreadyApplied
        );
    }

    #[test]
    fn test_remove_unique_field() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        let mut email = field("email", FieldType::String);
        email.unique = true;
        ddl.add_field(PHYSICAL, &email).unwrap();

        assert_eq!(ddl.remove_field(PHYSICAL, "email").unwrap(), DdlOutcome::Applied);
        assert_eq!(columns(&ddl), vec!["id", "created_at", "updated_at"]);
        assert!(ddl.engine().describe_indexes(PHYSICAL).unwrap().is_empty());
    }

    #[test]
    fn test_rename_round_trip() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        ddl.add_field(PHYSICAL, &field("a", FieldType::Text)).unwrap();

        assert_eq!(ddl.rename_field(PHYSICAL, "a", "b").unwrap(), DdlOutcome::Applied);
        // Redelivery of the same job.
        assert_eq!(
            ddl.rename_field(PHYSICAL, "a", "b").unwrap(),
            DdlOutcome::AlreadyApplied
        );
        assert_eq!(ddl.rename_field(PHYSICAL, "b", "a").unwrap(), DdlOutcome::Applied);
        assert_eq!(columns(&ddl), vec!["id", "created_at", "updated_at", "a"]);
    }

    #[test]
    fn test_rename_preconditions() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        ddl.add_field(PHYSICAL, &field("a", FieldType::Text)).unwrap();
        ddl.add_field(PHYSICAL, &field("b", FieldType::Text)).unwrap();

        assert!(matches!(
            ddl.rename_field(PHYSICAL, "a", "Bad Name"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            ddl.rename_field(PHYSICAL, "a", "b"),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            ddl.rename_field(PHYSICAL, "x", "y"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_change_type_incompatible_data_is_terminal() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        ddl.add_field(PHYSICAL, &field("age", FieldType::String)).unwrap();
        insert(&ddl, vec![("age", SqlValue::Text("abc".into()))]);

        let err = ddl
            .change_field_type(PHYSICAL, "age", FieldType::Integer)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SchemaApply(SchemaApplyError::Terminal(_))
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_change_type_same_type() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        ddl.add_field(PHYSICAL, &field("note", FieldType::String)).unwrap();
        assert_eq!(
            ddl.change_field_type(PHYSICAL, "note", FieldType::File).unwrap(),
            DdlOutcome::AlreadyApplied
        );
        assert_eq!(
            ddl.change_field_type(PHYSICAL, "note", FieldType::Text).unwrap(),
            DdlOutcome::Applied
        );
    }

    #[test]
    fn test_unique_toggle() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        ddl.add_field(PHYSICAL, &field("code", FieldType::String)).unwrap();

        assert_eq!(
            ddl.change_unique_constraint(PHYSICAL, "code", false).unwrap(),
            DdlOutcome::AlreadyApplied
        );
        assert_eq!(
            ddl.change_unique_constraint(PHYSICAL, "code", true).unwrap(),
            DdlOutcome::Applied
        );
        assert_eq!(
            ddl.change_unique_constraint(PHYSICAL, "code", true).unwrap(),
            DdlOutcome::AlreadyApplied
        );
        assert_eq!(
            ddl.change_unique_constraint(PHYSICAL, "code", false).unwrap(),
            DdlOutcome::Applied
        );
    }

    #[test]
    fn test_unique_on_duplicates_conflicts() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        ddl.add_field(PHYSICAL, &field("email", FieldType::String)).unwrap();
        insert(&ddl, vec![("email", SqlValue::Text("a@x.io".into()))]);
        insert(&ddl, vec![("email", SqlValue::Text("a@x.io".into()))]);

        let result = ddl.change_unique_constraint(PHYSICAL, "email", true);
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert!(!ddl.engine().has_unique_index(PHYSICAL, "email").unwrap());
    }

    #[test]
    fn test_drop_table() {
        let ddl = service();
        ddl.ensure_table_exists(PHYSICAL).unwrap();
        assert_eq!(ddl.drop_table(PHYSICAL).unwrap(), DdlOutcome::Applied);
        assert_eq!(ddl.drop_table(PHYSICAL).unwrap(), DdlOutcome::AlreadyApplied);
    }
}
