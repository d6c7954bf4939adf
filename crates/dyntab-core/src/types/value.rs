//! Engine-neutral scalar values and type coercion.

use super::FieldType;
use crate::error::Error;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Storage format for `date` values.
pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

/// Storage format for `datetime` values.
pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const DATETIME_INPUT_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// A scalar value as exchanged with an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Boolean.
    Bool(bool),
}

/// A value that cannot be represented as the requested field type.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert {value} to {target}")]
pub struct CoercionError {
    /// Display form of the offending value.
    pub value: String,
    /// Requested type.
    pub target: FieldType,
}

impl SqlValue {
    /// Check if this is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Borrow the text payload, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON input value.
    ///
    /// Arrays and objects are rejected; every field type is scalar.
    pub fn from_json(value: &JsonValue) -> Result<Self, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::Bool(b) => Ok(SqlValue::Bool(*b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Ok(SqlValue::Integer(i)),
                None => n
                    .as_f64()
                    .map(SqlValue::Real)
                    .ok_or_else(|| Error::Validation(format!("unsupported number {n}"))),
            },
            JsonValue::String(s) => Ok(SqlValue::Text(s.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => Err(Error::Validation(
                "nested values are not supported".to_string(),
            )),
        }
    }

    /// Render as JSON, interpreting the stored value according to `field_type`.
    pub fn to_json(&self, field_type: FieldType) -> JsonValue {
        match (self, field_type) {
            (SqlValue::Null, _) => JsonValue::Null,
            (SqlValue::Integer(i), FieldType::Boolean) => JsonValue::Bool(*i != 0),
            (SqlValue::Integer(i), FieldType::Decimal | FieldType::Float) => {
                json_number(*i as f64)
            }
            (SqlValue::Integer(i), _) => JsonValue::from(*i),
            (SqlValue::Real(f), _) => json_number(*f),
            (SqlValue::Bool(b), _) => JsonValue::Bool(*b),
            (SqlValue::Text(s), _) => JsonValue::String(s.clone()),
        }
    }

    /// Convert this value to the representation stored for `target`.
    pub fn coerce(&self, target: FieldType) -> Result<SqlValue, CoercionError> {
        if self.is_null() {
            return Ok(SqlValue::Null);
        }
        let converted = match target {
            FieldType::String | FieldType::Text | FieldType::File => Some(self.to_text()),
            FieldType::Integer => self.to_integer(),
            FieldType::Decimal | FieldType::Float => self.to_real(),
            FieldType::Boolean => self.to_bool(),
            FieldType::Date => self.to_date(),
            FieldType::Datetime => self.to_datetime(),
        };
        converted.ok_or_else(|| CoercionError {
            value: self.to_string(),
            target,
        })
    }

    fn to_text(&self) -> SqlValue {
        match self {
            SqlValue::Text(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }

    fn to_integer(&self) -> Option<SqlValue> {
        match self {
            SqlValue::Integer(i) => Some(SqlValue::Integer(*i)),
            SqlValue::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
            SqlValue::Real(f) => real_to_integer(*f),
            SqlValue::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Some(SqlValue::Null);
                }
                match s.parse::<i64>() {
                    Ok(i) => Some(SqlValue::Integer(i)),
                    Err(_) => s.parse::<f64>().ok().and_then(real_to_integer),
                }
            }
            SqlValue::Null => Some(SqlValue::Null),
        }
    }

    fn to_real(&self) -> Option<SqlValue> {
        match self {
            SqlValue::Integer(i) => Some(SqlValue::Real(*i as f64)),
            SqlValue::Real(f) => Some(SqlValue::Real(*f)),
            SqlValue::Bool(b) => Some(SqlValue::Real(if *b { 1.0 } else { 0.0 })),
            SqlValue::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Some(SqlValue::Null);
                }
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(SqlValue::Real)
            }
            SqlValue::Null => Some(SqlValue::Null),
        }
    }

    fn to_bool(&self) -> Option<SqlValue> {
        match self {
            SqlValue::Bool(b) => Some(SqlValue::Bool(*b)),
            SqlValue::Integer(0) => Some(SqlValue::Bool(false)),
            SqlValue::Integer(1) => Some(SqlValue::Bool(true)),
            SqlValue::Real(f) if *f == 0.0 => Some(SqlValue::Bool(false)),
            SqlValue::Real(f) if *f == 1.0 => Some(SqlValue::Bool(true)),
            SqlValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Some(SqlValue::Null),
                "true" | "t" | "1" | "yes" | "y" | "on" => Some(SqlValue::Bool(true)),
                "false" | "f" | "0" | "no" | "n" | "off" => Some(SqlValue::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }

    fn to_date(&self) -> Option<SqlValue> {
        let s = self.as_text()?.trim();
        if s.is_empty() {
            return Some(SqlValue::Null);
        }
        let date = NaiveDate::parse_from_str(s, DATE_FORMAT)
            .ok()
            .or_else(|| parse_datetime(s).map(|dt| dt.date()))?;
        Some(SqlValue::Text(date.format(DATE_FORMAT).to_string()))
    }

    fn to_datetime(&self) -> Option<SqlValue> {
        let s = self.as_text()?.trim();
        if s.is_empty() {
            return Some(SqlValue::Null);
        }
        let dt = parse_datetime(s).or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
        Some(SqlValue::Text(dt.format(DATETIME_FORMAT).to_string()))
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r}"),
            SqlValue::Text(s) => write!(f, "{s}"),
            SqlValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

fn real_to_integer(f: f64) -> Option<SqlValue> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(SqlValue::Integer(f as i64))
    } else {
        None
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    DATETIME_INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn json_number(f: f64) -> JsonValue {
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}
