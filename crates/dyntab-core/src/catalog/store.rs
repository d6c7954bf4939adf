//! Durable table and field metadata.

use super::{FieldDef, FieldUpdate, NewField, NewTable, SyncFailure, TableDef, TableUpdate};
use crate::clock::current_timestamp;
use crate::error::{Error, Result};
use crate::naming;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Transactional, Tree};

/// Tree name for table records.
const TABLES_TREE: &str = "catalog:tables";

/// Tree name for field records.
const FIELDS_TREE: &str = "catalog:fields";

/// Tree name for the owner-scoped table name index.
const TABLE_NAMES_TREE: &str = "catalog:table_names";

/// Tree name for the API identifier index.
const API_IDENTIFIERS_TREE: &str = "catalog:api_identifiers";

/// Tree name for the per-table field name index.
const FIELD_NAMES_TREE: &str = "catalog:field_names";

/// Metadata store for dynamic tables and their fields.
///
/// Name uniqueness is enforced through index trees that are updated in the
/// same sled transaction as the records they point to.
#[derive(Clone)]
pub struct MetadataStore {
    db: Db,
    tables: Tree,
    fields: Tree,
    table_names: Tree,
    api_identifiers: Tree,
    field_names: Tree,
}

fn abort(err: Error) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(err)
}

fn table_name_key(owner_id: u64, name: &str) -> Vec<u8> {
    let mut key = owner_id.to_be_bytes().to_vec();
    key.extend_from_slice(name.trim().to_lowercase().as_bytes());
    key
}

fn field_name_key(table_id: u64, name: &str) -> Vec<u8> {
    let mut key = table_id.to_be_bytes().to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization(format!("invalid id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

impl MetadataStore {
    /// Open or create the metadata trees in the given sled database.
    pub fn open(db: &Db) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            tables: db.open_tree(TABLES_TREE)?,
            fields: db.open_tree(FIELDS_TREE)?,
            table_names: db.open_tree(TABLE_NAMES_TREE)?,
            api_identifiers: db.open_tree(API_IDENTIFIERS_TREE)?,
            field_names: db.open_tree(FIELD_NAMES_TREE)?,
        })
    }

    // Tables

    /// Create a table record. Fields listed in `new` are not created here.
    pub fn create_table(&self, new: &NewTable) -> Result<TableDef> {
        naming::validate_table_name(&new.table_name)?;
        if let Some(identifier) = &new.api_identifier {
            naming::validate_api_identifier(identifier)?;
        }

        let now = current_timestamp();
        let table = TableDef {
            id: self.db.generate_id()?,
            owner_id: new.owner_id,
            table_name: new.table_name.trim().to_string(),
            api_identifier: new.api_identifier.clone(),
            webhook_url: new.webhook_url.clone(),
            schema_generation: 0,
            sync_failure: None,
            created_at: now,
            updated_at: now,
        };
        let id_key = table.id.to_be_bytes();
        let name_key = table_name_key(table.owner_id, &table.table_name);
        let bytes = table.to_bytes()?;

        (&self.tables, &self.table_names, &self.api_identifiers).transaction(
            |(tables, names, identifiers)| -> ConflictableTransactionResult<(), Error> {
                if names.get(&name_key[..])?.is_some() {
                    return Err(abort(Error::Conflict(format!(
                        "table name {:?} is already taken",
                        table.table_name
                    ))));
                }
                if let Some(identifier) = &table.api_identifier {
                    if identifiers.get(identifier.as_bytes())?.is_some() {
                        return Err(abort(Error::Conflict(format!(
                            "api identifier {identifier:?} is already taken"
                        ))));
                    }
                    identifiers.insert(identifier.as_bytes(), &id_key[..])?;
                }
                names.insert(&name_key[..], &id_key[..])?;
                tables.insert(&id_key[..], bytes.clone())?;
                Ok(())
            },
        )?;

        tracing::debug!(table_id = table.id, name = %table.table_name, "created table metadata");
        Ok(table)
    }

    /// Get a table by id.
    pub fn get_table(&self, id: u64) -> Result<Option<TableDef>> {
        match self.tables.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(TableDef::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a table by id, failing with `NotFound` when absent.
    pub fn require_table(&self, id: u64) -> Result<TableDef> {
        self.get_table(id)?
            .ok_or_else(|| Error::not_found("table", id))
    }

    /// Apply a partial update to a table.
    pub fn update_table(&self, id: u64, update: &TableUpdate) -> Result<TableDef> {
        if let Some(name) = &update.table_name {
            naming::validate_table_name(name)?;
        }
        if let Some(identifier) = &update.api_identifier {
            naming::validate_api_identifier(identifier)?;
        }

        let id_key = id.to_be_bytes();
        let now = current_timestamp();
        let table = (&self.tables, &self.table_names, &self.api_identifiers).transaction(
            |(tables, names, identifiers)| -> ConflictableTransactionResult<TableDef, Error> {
                let bytes = tables
                    .get(&id_key[..])?
                    .ok_or_else(|| abort(Error::not_found("table", id)))?;
                let mut table = TableDef::from_bytes(&bytes).map_err(abort)?;

                if let Some(name) = &update.table_name {
                    let name = name.trim();
                    let old_key = table_name_key(table.owner_id, &table.table_name);
                    let new_key = table_name_key(table.owner_id, name);
                    if old_key != new_key {
                        if names.get(&new_key[..])?.is_some() {
                            return Err(abort(Error::Conflict(format!(
                                "table name {name:?} is already taken"
                            ))));
                        }
                        names.remove(&old_key[..])?;
                        names.insert(&new_key[..], &id_key[..])?;
                    }
                    table.table_name = name.to_string();
                }

                if let Some(identifier) = &update.api_identifier {
                    match &table.api_identifier {
                        Some(current) if current == identifier => {}
                        Some(current) => {
                            return Err(abort(Error::Validation(format!(
                                "api identifier {current:?} cannot be changed"
                            ))));
                        }
                        None => {
                            if identifiers.get(identifier.as_bytes())?.is_some() {
                                return Err(abort(Error::Conflict(format!(
                                    "api identifier {identifier:?} is already taken"
                                ))));
                            }
                            identifiers.insert(identifier.as_bytes(), &id_key[..])?;
                            table.api_identifier = Some(identifier.clone());
                        }
                    }
                }

                if let Some(url) = &update.webhook_url {
                    table.webhook_url = url.clone();
                }

                table.updated_at = now;
                tables.insert(&id_key[..], table.to_bytes().map_err(abort)?)?;
                Ok(table)
            },
        )?;
        Ok(table)
    }

    /// Delete a table and, in cascade, the metadata of its fields.
    ///
    /// Returns the removed table and fields. The physical table is untouched.
    pub fn delete_table(&self, id: u64) -> Result<(TableDef, Vec<FieldDef>)> {
        let fields = self.fields_for_table(id)?;
        let id_key = id.to_be_bytes();

        let table = (
            &self.tables,
            &self.table_names,
            &self.api_identifiers,
            &self.fields,
            &self.field_names,
        )
            .transaction(
                |(tables, names, identifiers, field_tree, field_name_tree)| -> ConflictableTransactionResult<TableDef, Error> {
                    let bytes = tables
                        .remove(&id_key[..])?
                        .ok_or_else(|| abort(Error::not_found("table", id)))?;
                    let table = TableDef::from_bytes(&bytes).map_err(abort)?;
                    names.remove(&table_name_key(table.owner_id, &table.table_name)[..])?;
                    if let Some(identifier) = &table.api_identifier {
                        identifiers.remove(identifier.as_bytes())?;
                    }
                    for field in &fields {
                        field_tree.remove(&field.id.to_be_bytes()[..])?;
                        field_name_tree.remove(&field_name_key(id, &field.name)[..])?;
                    }
                    Ok(table)
                },
            )?;

        // A field created between the scan and the transaction survives the
        // cascade above; sweep again now that the table record is gone.
        let mut removed = fields;
        for orphan in self.fields_for_table(id)? {
            self.delete_field(orphan.id)?;
            removed.push(orphan);
        }

        tracing::debug!(table_id = id, fields = removed.len(), "deleted table metadata");
        Ok((table, removed))
    }

    /// List the tables of an owner, oldest first.
    pub fn list_tables(&self, owner_id: u64) -> Result<Vec<TableDef>> {
        let mut tables = Vec::new();
        for entry in self.table_names.scan_prefix(owner_id.to_be_bytes()) {
            let (_, id_bytes) = entry?;
            if let Some(table) = self.get_table(decode_id(&id_bytes)?)? {
                tables.push(table);
            }
        }
        tables.sort_by_key(|t| t.id);
        Ok(tables)
    }

    /// Resolve a table from a request path segment.
    ///
    /// The API identifier wins; otherwise the display name is matched
    /// case-insensitively within the owner's tables.
    pub fn find_table_by_identifier(
        &self,
        owner_id: u64,
        identifier: &str,
    ) -> Result<Option<TableDef>> {
        if let Some(id_bytes) = self.api_identifiers.get(identifier.as_bytes())? {
            if let Some(table) = self.get_table(decode_id(&id_bytes)?)? {
                if table.owner_id == owner_id {
                    return Ok(Some(table));
                }
            }
        }
        match self.table_names.get(table_name_key(owner_id, identifier))? {
            Some(id_bytes) => self.get_table(decode_id(&id_bytes)?),
            None => Ok(None),
        }
    }

    /// Increment a table's schema generation, returning the new value.
    pub fn bump_generation(&self, table_id: u64) -> Result<u64> {
        let table = self
            .modify_table(table_id, |t| {
                t.schema_generation += 1;
            })?
            .ok_or_else(|| Error::not_found("table", table_id))?;
        Ok(table.schema_generation)
    }

    /// Record a terminal job failure on a table. Returns false if the table is gone.
    pub fn mark_table_out_of_sync(&self, table_id: u64, failure: SyncFailure) -> Result<bool> {
        Ok(self
            .modify_table(table_id, |t| t.sync_failure = Some(failure.clone()))?
            .is_some())
    }

    /// Clear a table's recorded failure. Returns false if the table is gone.
    pub fn clear_table_sync_failure(&self, table_id: u64) -> Result<bool> {
        Ok(self
            .modify_table(table_id, |t| t.sync_failure = None)?
            .is_some())
    }

    fn modify_table<F>(&self, id: u64, f: F) -> Result<Option<TableDef>>
    where
        F: Fn(&mut TableDef),
    {
        let key = id.to_be_bytes();
        let now = current_timestamp();
        let table = self
            .tables
            .transaction(|tx| -> ConflictableTransactionResult<Option<TableDef>, Error> {
                let Some(bytes) = tx.get(&key[..])? else {
                    return Ok(None);
                };
                let mut table = TableDef::from_bytes(&bytes).map_err(abort)?;
                f(&mut table);
                table.updated_at = now;
                tx.insert(&key[..], table.to_bytes().map_err(abort)?)?;
                Ok(Some(table))
            })?;
        Ok(table)
    }

    // Fields

    /// Create a field on an existing table.
    pub fn create_field(&self, table_id: u64, new: &NewField) -> Result<FieldDef> {
        naming::validate_field_name(&new.name)?;

        let now = current_timestamp();
        let field = FieldDef {
            id: self.db.generate_id()?,
            table_id,
            name: new.name.clone(),
            field_type: new.field_type,
            required: new.required,
            unique: new.unique,
            sync_failure: None,
            created_at: now,
            updated_at: now,
        };
        let table_key = table_id.to_be_bytes();
        let id_key = field.id.to_be_bytes();
        let name_key = field_name_key(table_id, &field.name);
        let bytes = field.to_bytes()?;

        (&self.tables, &self.fields, &self.field_names).transaction(
            |(tables, fields, names)| -> ConflictableTransactionResult<(), Error> {
                if tables.get(&table_key[..])?.is_none() {
                    return Err(abort(Error::not_found("table", table_id)));
                }
                if names.get(&name_key[..])?.is_some() {
                    return Err(abort(Error::Conflict(format!(
                        "field {:?} already exists",
                        field.name
                    ))));
                }
                names.insert(&name_key[..], &id_key[..])?;
                fields.insert(&id_key[..], bytes.clone())?;
                Ok(())
            },
        )?;

        tracing::debug!(table_id, field_id = field.id, column = %field.name, "created field metadata");
        Ok(field)
    }

    /// Get a field by id.
    pub fn get_field(&self, id: u64) -> Result<Option<FieldDef>> {
        match self.fields.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(FieldDef::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a field by id, failing with `NotFound` when absent.
    pub fn require_field(&self, id: u64) -> Result<FieldDef> {
        self.get_field(id)?
            .ok_or_else(|| Error::not_found("field", id))
    }

    /// Apply a partial update to a field.
    pub fn update_field(&self, id: u64, update: &FieldUpdate) -> Result<FieldDef> {
        if let Some(name) = &update.name {
            naming::validate_field_name(name)?;
        }

        let id_key = id.to_be_bytes();
        let now = current_timestamp();
        let field = (&self.fields, &self.field_names).transaction(
            |(fields, names)| -> ConflictableTransactionResult<FieldDef, Error> {
                let bytes = fields
                    .get(&id_key[..])?
                    .ok_or_else(|| abort(Error::not_found("field", id)))?;
                let mut field = FieldDef::from_bytes(&bytes).map_err(abort)?;

                if let Some(name) = &update.name {
                    if name != &field.name {
                        let new_key = field_name_key(field.table_id, name);
                        if names.get(&new_key[..])?.is_some() {
                            return Err(abort(Error::Conflict(format!(
                                "field {name:?} already exists"
                            ))));
                        }
                        names.remove(&field_name_key(field.table_id, &field.name)[..])?;
                        names.insert(&new_key[..], &id_key[..])?;
                        field.name = name.clone();
                    }
                }
                if let Some(field_type) = update.field_type {
                    field.field_type = field_type;
                }
                if let Some(required) = update.required {
                    field.required = required;
                }
                if let Some(unique) = update.unique {
                    field.unique = unique;
                }

                field.updated_at = now;
                fields.insert(&id_key[..], field.to_bytes().map_err(abort)?)?;
                Ok(field)
            },
        )?;
        Ok(field)
    }

    /// Delete a field's metadata, returning it.
    pub fn delete_field(&self, id: u64) -> Result<FieldDef> {
        let id_key = id.to_be_bytes();
        let field = (&self.fields, &self.field_names).transaction(
            |(fields, names)| -> ConflictableTransactionResult<FieldDef, Error> {
                let bytes = fields
                    .remove(&id_key[..])?
                    .ok_or_else(|| abort(Error::not_found("field", id)))?;
                let field = FieldDef::from_bytes(&bytes).map_err(abort)?;
                names.remove(&field_name_key(field.table_id, &field.name)[..])?;
                Ok(field)
            },
        )?;
        Ok(field)
    }

    /// Fields of a table in creation order.
    pub fn fields_for_table(&self, table_id: u64) -> Result<Vec<FieldDef>> {
        let mut fields = Vec::new();
        for entry in self.field_names.scan_prefix(table_id.to_be_bytes()) {
            let (_, id_bytes) = entry?;
            if let Some(field) = self.get_field(decode_id(&id_bytes)?)? {
                fields.push(field);
            }
        }
        fields.sort_by_key(|f| f.id);
        Ok(fields)
    }

    /// Find a field of a table by column name.
    pub fn find_field_by_name(&self, table_id: u64, name: &str) -> Result<Option<FieldDef>> {
        match self.field_names.get(field_name_key(table_id, name))? {
            Some(id_bytes) => self.get_field(decode_id(&id_bytes)?),
            None => Ok(None),
        }
    }

    /// Record a terminal job failure on a field. Returns false if the field is gone.
    pub fn mark_field_out_of_sync(&self, field_id: u64, failure: SyncFailure) -> Result<bool> {
        Ok(self
            .modify_field(field_id, |f| f.sync_failure = Some(failure.clone()))?
            .is_some())
    }

    /// Clear a field's recorded failure. Returns false if the field is gone.
    pub fn clear_field_sync_failure(&self, field_id: u64) -> Result<bool> {
        Ok(self
            .modify_field(field_id, |f| f.sync_failure = None)?
            .is_some())
    }

    /// Read-modify-write a field record; `None` if it does not exist.
    ///
    /// Only for attributes that do not participate in the name index.
    pub(crate) fn modify_field<F>(&self, id: u64, f: F) -> Result<Option<FieldDef>>
    where
        F: Fn(&mut FieldDef),
    {
        let key = id.to_be_bytes();
        let now = current_timestamp();
        let field = self
            .fields
            .transaction(|tx| -> ConflictableTransactionResult<Option<FieldDef>, Error> {
                let Some(bytes) = tx.get(&key[..])? else {
                    return Ok(None);
                };
                let mut field = FieldDef::from_bytes(&bytes).map_err(abort)?;
                f(&mut field);
                field.updated_at = now;
                tx.insert(&key[..], field.to_bytes().map_err(abort)?)?;
                Ok(Some(field))
            })?;
        Ok(field)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.tables.flush()?;
        self.fields.flush()?;
        self.table_names.flush()?;
        self.api_identifiers.flush()?;
        self.field_names.flush()?;
        Ok(())
    }
}
