//! Field metadata.

use super::table::SyncFailure;
use crate::codec::impl_rkyv_codec;
use crate::types::FieldType;
use rkyv::{Archive, Deserialize, Serialize};

/// A column of a user-defined table.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct FieldDef {
    /// Stable id.
    pub id: u64,
    /// Owning table.
    pub table_id: u64,
    /// Column name, unique within the table.
    pub name: String,
    /// Declared type.
    pub field_type: FieldType,
    /// NOT NULL.
    pub required: bool,
    /// Backed by a unique index.
    pub unique: bool,
    /// Last terminal failure of a job for this field.
    pub sync_failure: Option<SyncFailure>,
    /// Creation time (microseconds since epoch).
    pub created_at: u64,
    /// Last modification time (microseconds since epoch).
    pub updated_at: u64,
}

impl FieldDef {
    /// Check if the last job for this field succeeded.
    pub fn is_in_sync(&self) -> bool {
        self.sync_failure.is_none()
    }
}

impl_rkyv_codec!(FieldDef);

/// Input for creating a field.
#[derive(Debug, Clone, PartialEq)]
pub struct NewField {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub field_type: FieldType,
    /// NOT NULL.
    pub required: bool,
    /// Unique index.
    pub unique: bool,
}

impl NewField {
    /// Create an optional, non-unique field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            unique: false,
        }
    }

    /// Mark as NOT NULL.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Partial update of field metadata. `None` leaves a value unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    /// New column name.
    pub name: Option<String>,
    /// New declared type.
    pub field_type: Option<FieldType>,
    /// New NOT NULL flag.
    pub required: Option<bool>,
    /// New uniqueness flag.
    pub unique: Option<bool>,
}

impl FieldUpdate {
    /// Check if nothing would change.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.field_type.is_none()
            && self.required.is_none()
            && self.unique.is_none()
    }
}

/// One entry of a bulk field submission.
///
/// Entries with an id update that field; entries without one create a field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Existing field id.
    pub id: Option<u64>,
    /// Desired definition.
    pub field: NewField,
}

impl FieldSpec {
    /// Entry for a field to create.
    pub fn create(field: NewField) -> Self {
        Self { id: None, field }
    }

    /// Entry for an existing field.
    pub fn existing(id: u64, field: NewField) -> Self {
        Self { id: Some(id), field }
    }
}
