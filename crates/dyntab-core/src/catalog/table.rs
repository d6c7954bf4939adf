//! Table metadata.

use super::field::NewField;
use crate::codec::impl_rkyv_codec;
use crate::naming;
use rkyv::{Archive, Deserialize, Serialize};

/// Base path of the generic record API.
pub const API_BASE_PATH: &str = "/api/v1";

/// A terminal schema job failure recorded against a table or field.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct SyncFailure {
    /// Job that failed.
    pub job_id: u64,
    /// Human-readable reason.
    pub reason: String,
    /// When the failure was recorded (microseconds since epoch).
    pub failed_at: u64,
}

/// A user-defined table.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct TableDef {
    /// Stable id; the physical table name derives from it.
    pub id: u64,
    /// Owner scope for name uniqueness.
    pub owner_id: u64,
    /// Display name, unique (case-insensitive) within the owner.
    pub table_name: String,
    /// Optional globally unique API identifier. Immutable once set.
    pub api_identifier: Option<String>,
    /// Endpoint notified on record changes.
    pub webhook_url: Option<String>,
    /// Incremented on every successful schema job.
    pub schema_generation: u64,
    /// Last terminal failure of a table-level job.
    pub sync_failure: Option<SyncFailure>,
    /// Creation time (microseconds since epoch).
    pub created_at: u64,
    /// Last modification time (microseconds since epoch).
    pub updated_at: u64,
}

impl TableDef {
    /// Physical table name.
    pub fn physical_name(&self) -> String {
        naming::physical_table_name(self.id)
    }

    /// Path of this table's record endpoints.
    pub fn api_path(&self) -> String {
        match &self.api_identifier {
            Some(identifier) => format!("{API_BASE_PATH}/{identifier}"),
            None => format!("{API_BASE_PATH}/{}", self.table_name.to_lowercase()),
        }
    }

    /// Check if the last table-level job succeeded.
    pub fn is_in_sync(&self) -> bool {
        self.sync_failure.is_none()
    }
}

impl_rkyv_codec!(TableDef);

/// Input for creating a table.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTable {
    /// Owner scope.
    pub owner_id: u64,
    /// Display name.
    pub table_name: String,
    /// Optional API identifier.
    pub api_identifier: Option<String>,
    /// Optional webhook endpoint.
    pub webhook_url: Option<String>,
    /// Fields created together with the table.
    pub fields: Vec<NewField>,
}

impl NewTable {
    /// Create a table definition with no fields.
    pub fn new(owner_id: u64, table_name: impl Into<String>) -> Self {
        Self {
            owner_id,
            table_name: table_name.into(),
            api_identifier: None,
            webhook_url: None,
            fields: Vec::new(),
        }
    }

    /// Set the API identifier.
    pub fn with_api_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.api_identifier = Some(identifier.into());
        self
    }

    /// Set the webhook endpoint.
    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Add a field.
    pub fn with_field(mut self, field: NewField) -> Self {
        self.fields.push(field);
        self
    }
}

/// Partial update of table metadata. `None` leaves a value unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableUpdate {
    /// New display name.
    pub table_name: Option<String>,
    /// API identifier; only accepted while none is set.
    pub api_identifier: Option<String>,
    /// New webhook endpoint; `Some(None)` clears it.
    pub webhook_url: Option<Option<String>>,
}

impl TableUpdate {
    /// Rename the table.
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            table_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Set the API identifier.
    pub fn with_api_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.api_identifier = Some(identifier.into());
        self
    }

    /// Set or clear the webhook endpoint.
    pub fn with_webhook_url(mut self, url: Option<String>) -> Self {
        self.webhook_url = Some(url);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(api_identifier: Option<&str>) -> TableDef {
        TableDef {
            id: 7,
            owner_id: 1,
            table_name: "Customer Orders".to_string(),
            api_identifier: api_identifier.map(String::from),
            webhook_url: None,
            schema_generation: 0,
            sync_failure: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn test_physical_name_and_path() {
        let t = table(None);
        assert_eq!(t.physical_name(), "dyn_7");
        assert_eq!(t.api_path(), "/api/v1/customer orders");
        assert_eq!(table(Some("orders")).api_path(), "/api/v1/orders");
    }

    #[test]
    fn test_serialization_keeps_sync_failure() {
        let mut t = table(Some("orders"));
        t.sync_failure = Some(SyncFailure {
            job_id: 3,
            reason: "boom".to_string(),
            failed_at: 99,
        });
        let decoded = TableDef::from_bytes(&t.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, t);
        assert!(!decoded.is_in_sync());
    }
}
