//! Metadata model for user-defined tables and fields.
//!
//! Metadata is the source of truth; physical tables are a projection of it
//! maintained by the schema job orchestrator.

mod field;
mod store;
mod table;

pub use field::{FieldDef, FieldSpec, FieldUpdate, NewField};
pub use store::MetadataStore;
pub use table::{NewTable, SyncFailure, TableDef, TableUpdate, API_BASE_PATH};
