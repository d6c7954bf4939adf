//! Field types and engine-neutral values shared by the catalog, engines, and record layer.

mod value;

pub use value::{CoercionError, SqlValue};
pub(crate) use value::DATETIME_FORMAT;

use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use std::str::FromStr;

/// The closed set of field types a dynamic table may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum FieldType {
    /// Short string (`VARCHAR(255)`).
    String,
    /// 64-bit signed integer.
    Integer,
    /// Boolean.
    Boolean,
    /// Unbounded text.
    Text,
    /// Calendar date (`YYYY-MM-DD`).
    Date,
    /// Timestamp without zone (`YYYY-MM-DD HH:MM:SS.ffffff`, UTC).
    Datetime,
    /// Fixed-point decimal (10, 2).
    Decimal,
    /// Double precision float.
    Float,
    /// Opaque reference to an externally stored blob.
    File,
}

impl FieldType {
    /// Every allowed field type.
    pub const ALL: [FieldType; 9] = [
        FieldType::String,
        FieldType::Integer,
        FieldType::Boolean,
        FieldType::Text,
        FieldType::Date,
        FieldType::Datetime,
        FieldType::Decimal,
        FieldType::Float,
        FieldType::File,
    ];

    /// Parse a type name from the allow-list.
    pub fn parse(name: &str) -> Result<Self, Error> {
        let normalized = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| Error::Validation(format!("{name} is not a valid field type")))
    }

    /// Canonical lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Text => "text",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Decimal => "decimal",
            FieldType::Float => "float",
            FieldType::File => "file",
        }
    }

    /// Check if values of this type are stored as text.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Text | FieldType::File
        )
    }

    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Integer | FieldType::Decimal | FieldType::Float
        )
    }

    /// Value used to backfill existing rows when a NOT NULL column is added.
    ///
    /// Temporal types default to the current date or time.
    pub fn backfill_default(&self) -> SqlValue {
        match self {
            FieldType::String | FieldType::Text | FieldType::File => SqlValue::Text(String::new()),
            FieldType::Integer => SqlValue::Integer(0),
            FieldType::Boolean => SqlValue::Bool(false),
            FieldType::Decimal | FieldType::Float => SqlValue::Real(0.0),
            FieldType::Date => SqlValue::Text(chrono::Utc::now().format(value::DATE_FORMAT).to_string()),
            FieldType::Datetime => {
                SqlValue::Text(chrono::Utc::now().format(value::DATETIME_FORMAT).to_string())
            }
        }
    }

    /// Best-effort mapping from an engine's declared column type back to a field type.
    ///
    /// Used for physical columns that have no metadata counterpart (for example, a
    /// column whose field was just deleted but whose removal job has not run yet).
    pub fn from_declared_type(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.starts_with("BOOL") {
            FieldType::Boolean
        } else if upper.contains("INT") {
            FieldType::Integer
        } else if upper.starts_with("DECIMAL") || upper.starts_with("NUMERIC") {
            FieldType::Decimal
        } else if upper.starts_with("FLOAT")
            || upper.starts_with("DOUBLE")
            || upper.starts_with("REAL")
        {
            FieldType::Float
        } else if upper.starts_with("DATETIME") || upper.starts_with("TIMESTAMP") {
            FieldType::Datetime
        } else if upper == "DATE" {
            FieldType::Date
        } else if upper.starts_with("VARCHAR") || upper.starts_with("CHARACTER VARYING") {
            FieldType::String
        } else {
            FieldType::Text
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldType::parse(s)
    }
}
