//! Generic record access against evolving physical tables.
//!
//! A table's physical columns are resolved once per schema generation into
//! a [`ResolvedSchema`] which drives validation, coercion and row mapping.
//! Columns whose field is not created yet, or already deleted, are simply
//! absent from the resolved schema.

mod query;

pub use query::{
    QueryFilter, RecordPage, RecordQuery, DEFAULT_PAGE, DEFAULT_PAGE_SIZE, DEFAULT_SORT_COLUMN,
};

use crate::blob::{BlobHandle, BlobRef, BlobStore};
use crate::catalog::{MetadataStore, TableDef};
use crate::engine::{Engine, Row, RowFilter, SelectSpec};
use crate::error::{Error, Result};
use crate::naming::{self, PRIMARY_KEY_COLUMN};
use crate::types::{FieldType, SqlValue, DATETIME_FORMAT};
use crate::webhook::{WebhookEvent, WebhookSink};
use dashmap::DashMap;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

/// A record as exchanged with callers: column name to JSON value.
pub type Record = serde_json::Map<String, JsonValue>;

/// A physical column as seen by the record layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedColumn {
    /// Column name.
    pub name: String,
    /// Engine-declared type.
    pub declared_type: String,
    /// Whether the engine allows NULL.
    pub nullable: bool,
    /// Field type used for coercion; from metadata, or derived from the
    /// declared type for system columns.
    pub field_type: FieldType,
    /// Whether writes must provide a non-blank value.
    pub required: bool,
    /// System columns are read-only.
    pub system: bool,
}

/// The queryable shape of a table at one schema generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSchema {
    /// Table id.
    pub table_id: u64,
    /// Physical table name.
    pub physical_name: String,
    /// Generation this schema was resolved at.
    pub generation: u64,
    /// Columns in physical order.
    pub columns: Vec<ResolvedColumn>,
}

impl ResolvedSchema {
    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&ResolvedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check if a column is queryable.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// All column names.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn record_from_row(&self, row: Row) -> Record {
        row.into_iter()
            .map(|(name, value)| {
                let field_type = self
                    .column(&name)
                    .map(|c| c.field_type)
                    .unwrap_or(FieldType::Text);
                let json = value.to_json(field_type);
                (name, json)
            })
            .collect()
    }
}

/// Timestamp text for `created_at`/`updated_at`.
fn now_text() -> String {
    chrono::Utc::now().naive_utc().format(DATETIME_FORMAT).to_string()
}

fn is_blank(value: &SqlValue) -> bool {
    match value {
        SqlValue::Null => true,
        SqlValue::Text(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// CRUD over dynamic tables.
pub struct RecordAccess {
    catalog: MetadataStore,
    engine: Arc<dyn Engine>,
    blobs: Arc<dyn BlobStore>,
    webhooks: Arc<dyn WebhookSink>,
    cache: DashMap<(u64, u64), Arc<ResolvedSchema>>,
}

impl RecordAccess {
    /// Create the record layer.
    pub fn new(
        catalog: MetadataStore,
        engine: Arc<dyn Engine>,
        blobs: Arc<dyn BlobStore>,
        webhooks: Arc<dyn WebhookSink>,
    ) -> Self {
        Self {
            catalog,
            engine,
            blobs,
            webhooks,
            cache: DashMap::new(),
        }
    }

    /// Resolve a table's current schema, using the cache when the
    /// generation has not moved.
    pub fn resolve_schema(&self, table_id: u64) -> Result<Arc<ResolvedSchema>> {
        let table = self.catalog.require_table(table_id)?;
        self.schema_for(&table)
    }

    /// Drop cached schemas of a table.
    pub fn invalidate(&self, table_id: u64) {
        self.cache.retain(|(id, _), _| *id != table_id);
    }

    fn schema_for(&self, table: &TableDef) -> Result<Arc<ResolvedSchema>> {
        let key = (table.id, table.schema_generation);
        if let Some(schema) = self.cache.get(&key) {
            return Ok(schema.clone());
        }

        let physical_name = table.physical_name();
        let fields = self.catalog.fields_for_table(table.id)?;
        let columns = self
            .engine
            .describe_columns(&physical_name)?
            .into_iter()
            .filter_map(|info| {
                if naming::is_system_column(&info.name) {
                    return Some(ResolvedColumn {
                        field_type: FieldType::from_declared_type(&info.declared_type),
                        name: info.name,
                        declared_type: info.declared_type,
                        nullable: info.nullable,
                        required: false,
                        system: true,
                    });
                }
                let field = fields.iter().find(|f| f.name == info.name)?;
                Some(ResolvedColumn {
                    name: info.name,
                    declared_type: info.declared_type,
                    nullable: info.nullable,
                    field_type: field.field_type,
                    required: field.required,
                    system: false,
                })
            })
            .collect();

        let schema = Arc::new(ResolvedSchema {
            table_id: table.id,
            physical_name,
            generation: table.schema_generation,
            columns,
        });
        self.invalidate(table.id);
        self.cache.insert(key, schema.clone());
        tracing::debug!(table_id = table.id, generation = table.schema_generation, "resolved table schema");
        Ok(schema)
    }

    /// List records.
    pub fn list(&self, table_id: u64, query: &RecordQuery) -> Result<RecordPage> {
        let schema = self.resolve_schema(table_id)?;

        let mut filters = Vec::with_capacity(query.filters.len());
        for filter in &query.filters {
            let Some(column) = schema.column(filter.column()) else {
                tracing::debug!(table_id, column = filter.column(), "ignoring filter on unknown column");
                continue;
            };
            filters.push(match filter {
                QueryFilter::Eq(_, value) => {
                    RowFilter::eq(&column.name, Self::coerce(column, value)?)
                }
                QueryFilter::Contains(_, needle) => RowFilter::contains(&column.name, needle.clone()),
            });
        }

        let sort_column = query
            .sort_column
            .as_deref()
            .filter(|c| schema.has_column(c))
            .unwrap_or(DEFAULT_SORT_COLUMN)
            .to_string();

        let total = self.engine.count_rows(&schema.physical_name, &filters)?;
        let spec = SelectSpec {
            columns: schema.column_names(),
            filters,
            sort: Some((sort_column, query.direction)),
            limit: Some(query.page_size),
            offset: query.offset(),
        };
        let records = self
            .engine
            .select_rows(&schema.physical_name, &spec)?
            .into_iter()
            .map(|row| schema.record_from_row(row))
            .collect();

        Ok(RecordPage {
            records,
            total,
            page: query.page,
            page_size: query.page_size,
        })
    }

    /// Get one record by id.
    pub fn get(&self, table_id: u64, id: i64) -> Result<Record> {
        let schema = self.resolve_schema(table_id)?;
        self.fetch(&schema, id)?
            .ok_or_else(|| Error::not_found("record", id))
    }

    fn fetch(&self, schema: &ResolvedSchema, id: i64) -> Result<Option<Record>> {
        let spec = SelectSpec {
            columns: schema.column_names(),
            filters: vec![RowFilter::eq(PRIMARY_KEY_COLUMN, SqlValue::Integer(id))],
            limit: Some(1),
            ..SelectSpec::default()
        };
        let row = self
            .engine
            .select_rows(&schema.physical_name, &spec)?
            .into_iter()
            .next();
        Ok(row.map(|row| schema.record_from_row(row)))
    }

    /// Insert a record and return it as stored.
    pub fn insert(&self, table_id: u64, values: &Record) -> Result<Record> {
        let table = self.catalog.require_table(table_id)?;
        let schema = self.schema_for(&table)?;

        let mut row = self.row_from_record(&schema, values)?;
        for column in schema.columns.iter().filter(|c| c.required) {
            let provided = row.iter().any(|(name, value)| *name == column.name && !is_blank(value));
            if !provided {
                return Err(Error::Validation(format!("{} can't be blank", column.name)));
            }
        }
        let now = now_text();
        row.push(("created_at".to_string(), SqlValue::Text(now.clone())));
        row.push(("updated_at".to_string(), SqlValue::Text(now)));

        let id = self.engine.insert_row(&schema.physical_name, &row)?;
        let record = self
            .fetch(&schema, id)?
            .ok_or_else(|| Error::not_found("record", id))?;
        tracing::debug!(table_id, record_id = id, "inserted record");
        self.notify(&table, WebhookEvent::RecordCreated, &record);
        Ok(record)
    }

    /// Update the given columns of a record and return it as stored.
    pub fn update(&self, table_id: u64, id: i64, values: &Record) -> Result<Record> {
        let table = self.catalog.require_table(table_id)?;
        let schema = self.schema_for(&table)?;

        let mut row = self.row_from_record(&schema, values)?;
        for (name, value) in &row {
            if schema.column(name).is_some_and(|c| c.required) && is_blank(value) {
                return Err(Error::Validation(format!("{name} can't be blank")));
            }
        }
        row.push(("updated_at".to_string(), SqlValue::Text(now_text())));

        if !self.engine.update_row(&schema.physical_name, id, &row)? {
            return Err(Error::not_found("record", id));
        }
        let record = self
            .fetch(&schema, id)?
            .ok_or_else(|| Error::not_found("record", id))?;
        tracing::debug!(table_id, record_id = id, "updated record");
        self.notify(&table, WebhookEvent::RecordUpdated, &record);
        Ok(record)
    }

    /// Delete a record.
    pub fn delete(&self, table_id: u64, id: i64) -> Result<()> {
        let table = self.catalog.require_table(table_id)?;
        let schema = self.schema_for(&table)?;

        let record = self
            .fetch(&schema, id)?
            .ok_or_else(|| Error::not_found("record", id))?;
        if !self.engine.delete_row(&schema.physical_name, id)? {
            return Err(Error::not_found("record", id));
        }
        tracing::debug!(table_id, record_id = id, "deleted record");
        self.notify(&table, WebhookEvent::RecordDeleted, &record);
        Ok(())
    }

    /// Store a file and reference it from a `file` column of a record.
    pub fn attach_file(
        &self,
        table_id: u64,
        id: i64,
        field: &str,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
    ) -> Result<Record> {
        let schema = self.resolve_schema(table_id)?;
        Self::require_file_column(&schema, field)?;
        let reference = self.blobs.store(bytes, filename, content_type)?;

        let mut values = Record::new();
        values.insert(field.to_string(), JsonValue::String(reference.to_string()));
        self.update(table_id, id, &values)
    }

    /// Resolve the blob referenced by a `file` column. `None` when empty.
    pub fn resolve_file(&self, table_id: u64, id: i64, field: &str) -> Result<Option<BlobHandle>> {
        let schema = self.resolve_schema(table_id)?;
        Self::require_file_column(&schema, field)?;
        let record = self
            .fetch(&schema, id)?
            .ok_or_else(|| Error::not_found("record", id))?;

        match record.get(field) {
            Some(JsonValue::String(reference)) if !reference.is_empty() => {
                Ok(Some(self.blobs.resolve(&BlobRef::new(reference.clone()))?))
            }
            _ => Ok(None),
        }
    }

    fn require_file_column(schema: &ResolvedSchema, field: &str) -> Result<()> {
        match schema.column(field) {
            Some(c) if c.field_type == FieldType::File => Ok(()),
            Some(_) => Err(Error::Validation(format!("{field} is not a file field"))),
            None => Err(Error::not_found("field", field)),
        }
    }

    /// Validate and coerce caller values into an engine row.
    fn row_from_record(&self, schema: &ResolvedSchema, values: &Record) -> Result<Row> {
        let mut row = Row::with_capacity(values.len() + 2);
        for (name, value) in values {
            let column = schema
                .column(name)
                .ok_or_else(|| Error::Validation(format!("unknown field {name}")))?;
            if column.system {
                return Err(Error::Validation(format!("{name} is read-only")));
            }
            row.push((column.name.clone(), Self::coerce(column, value)?));
        }
        Ok(row)
    }

    fn coerce(column: &ResolvedColumn, value: &JsonValue) -> Result<SqlValue> {
        SqlValue::from_json(value)?
            .coerce(column.field_type)
            .map_err(|e| Error::Validation(format!("{} is invalid: {e}", column.name)))
    }

    fn notify(&self, table: &TableDef, event: WebhookEvent, record: &Record) {
        let Some(url) = &table.webhook_url else {
            return;
        };
        let payload = json!({
            "event": event.as_str(),
            "table": table.api_path(),
            "table_id": table.id,
            "record": record,
        });
        self.webhooks.notify(url, event, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::catalog::{FieldUpdate, NewField, NewTable, TableUpdate};
    use crate::ddl::DdlService;
    use crate::engine::{SortDirection, SqliteEngine};
    use crate::webhook::ChannelWebhookSink;
    use std::sync::mpsc::Receiver;

    struct Fixture {
        catalog: MetadataStore,
        ddl: DdlService,
        records: RecordAccess,
        events: Receiver<crate::webhook::WebhookDelivery>,
        table_id: u64,
    }

    /// Table `people(name string required, age integer, active boolean, cv file)`
    /// with metadata and physical schema in sync.
    fn fixture() -> Fixture {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let catalog = MetadataStore::open(&db).unwrap();
        let engine: Arc<dyn Engine> = Arc::new(SqliteEngine::in_memory().unwrap());
        let ddl = DdlService::new(engine.clone());
        let (sink, events) = ChannelWebhookSink::new(16);
        let records = RecordAccess::new(
            catalog.clone(),
            engine,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(sink),
        );

        let table = catalog.create_table(&NewTable::new(1, "People")).unwrap();
        ddl.ensure_table_exists(&table.physical_name()).unwrap();
        for field in [
            NewField::new("name", FieldType::String).required(),
            NewField::new("age", FieldType::Integer),
            NewField::new("active", FieldType::Boolean),
            NewField::new("cv", FieldType::File),
        ] {
            let field = catalog.create_field(table.id, &field).unwrap();
            ddl.add_field(&table.physical_name(), &field).unwrap();
        }
        catalog.bump_generation(table.id).unwrap();

        Fixture {
            catalog,
            ddl,
            records,
            events,
            table_id: table.id,
        }
    }

    fn record(value: JsonValue) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_insert_coerces_and_sets_timestamps() {
        let fx = fixture();
        let stored = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "Ann", "age": "41", "active": "yes"})))
            .unwrap();

        assert_eq!(stored["id"], json!(1));
        assert_eq!(stored["age"], json!(41));
        assert_eq!(stored["active"], json!(true));
        assert!(stored["created_at"].is_string());
        assert_eq!(stored["cv"], JsonValue::Null);
    }

    #[test]
    fn test_insert_validation() {
        let fx = fixture();
        let missing = fx.records.insert(fx.table_id, &record(json!({"age": 3})));
        assert!(matches!(missing, Err(Error::Validation(m)) if m == "name can't be blank"));

        let unknown = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "a", "nickname": "b"})));
        assert!(matches!(unknown, Err(Error::Validation(_))));

        let system = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "a", "id": 9})));
        assert!(matches!(system, Err(Error::Validation(m)) if m == "id is read-only"));

        let bad = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "a", "age": "old"})));
        assert!(matches!(bad, Err(Error::Validation(_))));
    }

    #[test]
    fn test_update_get_delete() {
        let fx = fixture();
        let created = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "Ann"})))
            .unwrap();
        let id = created["id"].as_i64().unwrap();

        let updated = fx
            .records
            .update(fx.table_id, id, &record(json!({"age": 7})))
            .unwrap();
        assert_eq!(updated["age"], json!(7));
        assert_eq!(updated["name"], json!("Ann"));

        let blank = fx.records.update(fx.table_id, id, &record(json!({"name": ""})));
        assert!(matches!(blank, Err(Error::Validation(_))));

        fx.records.delete(fx.table_id, id).unwrap();
        assert!(matches!(
            fx.records.get(fx.table_id, id),
            Err(Error::NotFound { entity: "record", .. })
        ));
        assert!(fx.records.delete(fx.table_id, id).is_err());
    }

    #[test]
    fn test_list_filters_sort_and_pages() {
        let fx = fixture();
        for (name, age) in [("Ann", 30), ("Bob", 20), ("Annie", 40)] {
            fx.records
                .insert(fx.table_id, &record(json!({"name": name, "age": age})))
                .unwrap();
        }

        let page = fx
            .records
            .list(
                fx.table_id,
                &RecordQuery::new()
                    .filter_contains("name", "ann")
                    .sort_by("age", SortDirection::Asc),
            )
            .unwrap();
        assert_eq!(page.total, 2);
        let names: Vec<_> = page.records.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("Ann"), json!("Annie")]);

        let page = fx
            .records
            .list(
                fx.table_id,
                &RecordQuery::new()
                    .sort_by("no_such_column", SortDirection::Desc)
                    .filter_eq("nope", 1)
                    .paginate(2, 2),
            )
            .unwrap();
        assert_eq!(page.total, 3);
        // Newest first: Annie, Bob | Ann.
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0]["name"], json!("Ann"));

        // The fallback column keeps the requested direction.
        let page = fx
            .records
            .list(
                fx.table_id,
                &RecordQuery::new()
                    .sort_by("no_such_column", SortDirection::Asc)
                    .paginate(2, 2),
            )
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0]["name"], json!("Annie"));

        let page = fx
            .records
            .list(fx.table_id, &RecordQuery::new().filter_eq("age", "20"))
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0]["name"], json!("Bob"));
    }

    #[test]
    fn test_schema_cache_follows_generation() {
        let fx = fixture();
        let before = fx.records.resolve_schema(fx.table_id).unwrap();
        assert!(Arc::ptr_eq(&before, &fx.records.resolve_schema(fx.table_id).unwrap()));

        // Metadata exists but the column is not created yet.
        let field = fx
            .catalog
            .create_field(fx.table_id, &NewField::new("email", FieldType::String))
            .unwrap();
        let pending = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "a", "email": "a@x.io"})));
        assert!(matches!(pending, Err(Error::Validation(_))));

        let table = fx.catalog.require_table(fx.table_id).unwrap();
        fx.ddl.add_field(&table.physical_name(), &field).unwrap();
        fx.catalog.bump_generation(fx.table_id).unwrap();

        let after = fx.records.resolve_schema(fx.table_id).unwrap();
        assert_eq!(after.generation, before.generation + 1);
        assert!(after.has_column("email"));
        fx.records
            .insert(fx.table_id, &record(json!({"name": "a", "email": "a@x.io"})))
            .unwrap();
    }

    #[test]
    fn test_deleted_field_column_is_hidden() {
        let fx = fixture();
        let age = fx.catalog.find_field_by_name(fx.table_id, "age").unwrap().unwrap();
        fx.catalog.delete_field(age.id).unwrap();
        fx.catalog.bump_generation(fx.table_id).unwrap();

        let stored = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "a"})))
            .unwrap();
        assert!(!stored.contains_key("age"));
        let write = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "a", "age": 1})));
        assert!(write.is_err());
    }

    #[test]
    fn test_required_toggle_applies_after_generation_bump() {
        let fx = fixture();
        let age = fx.catalog.find_field_by_name(fx.table_id, "age").unwrap().unwrap();
        fx.catalog
            .update_field(
                age.id,
                &FieldUpdate {
                    required: Some(true),
                    ..FieldUpdate::default()
                },
            )
            .unwrap();
        fx.catalog.bump_generation(fx.table_id).unwrap();

        let result = fx.records.insert(fx.table_id, &record(json!({"name": "a"})));
        assert!(matches!(result, Err(Error::Validation(m)) if m == "age can't be blank"));
    }

    #[test]
    fn test_webhook_events() {
        let fx = fixture();
        fx.records
            .insert(fx.table_id, &record(json!({"name": "quiet"})))
            .unwrap();
        assert!(fx.events.try_recv().is_err());

        fx.catalog
            .update_table(
                fx.table_id,
                &TableUpdate::default().with_webhook_url(Some("https://hooks.test/p".into())),
            )
            .unwrap();
        let created = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "loud"})))
            .unwrap();
        fx.records
            .delete(fx.table_id, created["id"].as_i64().unwrap())
            .unwrap();

        let first = fx.events.try_recv().unwrap();
        assert_eq!(first.event, WebhookEvent::RecordCreated);
        assert_eq!(first.url, "https://hooks.test/p");
        assert_eq!(first.payload["record"]["name"], json!("loud"));
        assert_eq!(fx.events.try_recv().unwrap().event, WebhookEvent::RecordDeleted);
    }

    #[test]
    fn test_file_fields() {
        let fx = fixture();
        let created = fx
            .records
            .insert(fx.table_id, &record(json!({"name": "Ann"})))
            .unwrap();
        let id = created["id"].as_i64().unwrap();
        assert_eq!(fx.records.resolve_file(fx.table_id, id, "cv").unwrap(), None);

        fx.records
            .attach_file(fx.table_id, id, "cv", b"%PDF", "cv.pdf", "application/pdf")
            .unwrap();
        let handle = fx.records.resolve_file(fx.table_id, id, "cv").unwrap().unwrap();
        assert_eq!(handle.filename, "cv.pdf");

        assert!(matches!(
            fx.records.resolve_file(fx.table_id, id, "name"),
            Err(Error::Validation(_))
        ));
    }
}
