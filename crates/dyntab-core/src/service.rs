//! Metadata mutations.
//!
//! Every mutation validates synchronously, writes metadata, enqueues one job
//! per physical change and returns without waiting for the jobs to run.

use crate::catalog::{FieldDef, FieldSpec, FieldUpdate, MetadataStore, NewField, NewTable, TableUpdate};
use crate::clock::current_timestamp;
use crate::error::{Error, Result};
use crate::jobs::{Job, JobOperation, JobQueue};
use crate::naming;
use std::collections::{HashMap, HashSet};

/// A mutation accepted for asynchronous physical application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Affected table.
    pub table_id: u64,
    /// Jobs enqueued, in execution order.
    pub jobs: Vec<u64>,
}

impl Accepted {
    fn new(table_id: u64) -> Self {
        Self {
            table_id,
            jobs: Vec::new(),
        }
    }

    /// Check if no physical change was needed.
    pub fn is_metadata_only(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Entry point for table and field mutations.
#[derive(Clone)]
pub struct SchemaService {
    catalog: MetadataStore,
    queue: JobQueue,
}

impl SchemaService {
    /// Create the service.
    pub fn new(catalog: MetadataStore, queue: JobQueue) -> Self {
        Self { catalog, queue }
    }

    fn enqueue(&self, accepted: &mut Accepted, operation: JobOperation) -> Result<()> {
        let job = self
            .queue
            .enqueue(accepted.table_id, operation, current_timestamp())?;
        accepted.jobs.push(job.id);
        Ok(())
    }

    /// Create a table and its initial fields.
    pub fn create_table(&self, new: &NewTable) -> Result<Accepted> {
        let mut names = HashSet::new();
        for field in &new.fields {
            naming::validate_field_name(&field.name)?;
            if !names.insert(field.name.as_str()) {
                return Err(Error::Conflict(format!("field {:?} is listed twice", field.name)));
            }
        }

        let table = self.catalog.create_table(new)?;
        let mut accepted = Accepted::new(table.id);
        self.enqueue(&mut accepted, JobOperation::EnsureTable)?;
        for field in &new.fields {
            self.create_field(&mut accepted, field)?;
        }

        tracing::info!(table_id = table.id, name = %table.table_name, fields = new.fields.len(), "table accepted");
        Ok(accepted)
    }

    /// Update table attributes. Never touches the physical table, whose
    /// name derives from the id alone.
    pub fn update_table(&self, table_id: u64, update: &TableUpdate) -> Result<Accepted> {
        self.catalog.update_table(table_id, update)?;
        Ok(Accepted::new(table_id))
    }

    /// Delete a table's metadata and enqueue the physical drop.
    pub fn delete_table(&self, table_id: u64) -> Result<Accepted> {
        let (table, fields) = self.catalog.delete_table(table_id)?;
        let mut accepted = Accepted::new(table_id);
        self.enqueue(
            &mut accepted,
            JobOperation::DropTable {
                physical_table: table.physical_name(),
            },
        )?;
        tracing::info!(table_id, fields = fields.len(), "table deletion accepted");
        Ok(accepted)
    }

    /// Add a field to a table.
    pub fn add_field(&self, table_id: u64, field: &NewField) -> Result<Accepted> {
        self.catalog.require_table(table_id)?;
        let mut accepted = Accepted::new(table_id);
        self.create_field(&mut accepted, field)?;
        Ok(accepted)
    }

    fn create_field(&self, accepted: &mut Accepted, new: &NewField) -> Result<FieldDef> {
        let field = self.catalog.create_field(accepted.table_id, new)?;
        self.enqueue(
            accepted,
            JobOperation::AddField {
                field_id: field.id,
                column: field.name.clone(),
            },
        )?;
        Ok(field)
    }

    /// Update a field.
    ///
    /// The name and the required flag change in metadata right away. Type and
    /// uniqueness depend on existing data: their jobs carry the requested
    /// value and metadata follows once the job succeeds.
    pub fn update_field(&self, field_id: u64, update: &FieldUpdate) -> Result<Accepted> {
        let current = self.catalog.require_field(field_id)?;
        let mut accepted = Accepted::new(current.table_id);
        self.apply_field_update(&mut accepted, &current, update)?;
        Ok(accepted)
    }

    fn apply_field_update(
        &self,
        accepted: &mut Accepted,
        current: &FieldDef,
        update: &FieldUpdate,
    ) -> Result<()> {
        let rename = update.name.as_ref().filter(|n| **n != current.name);
        if let Some(name) = rename {
            naming::validate_field_name(name)?;
        }
        let required = update.required.filter(|r| *r != current.required);
        let new_type = update.field_type.filter(|t| *t != current.field_type);
        let unique = update.unique.filter(|u| *u != current.unique);

        let immediate = FieldUpdate {
            name: rename.cloned(),
            required,
            ..FieldUpdate::default()
        };
        if !immediate.is_empty() {
            self.catalog.update_field(current.id, &immediate)?;
            self.catalog.bump_generation(current.table_id)?;
        }

        let column = rename.cloned().unwrap_or_else(|| current.name.clone());
        if let Some(to) = rename {
            self.enqueue(
                accepted,
                JobOperation::RenameField {
                    field_id: current.id,
                    from: current.name.clone(),
                    to: to.clone(),
                },
            )?;
        }
        if let Some(new_type) = new_type {
            self.enqueue(
                accepted,
                JobOperation::ChangeFieldType {
                    field_id: current.id,
                    column: column.clone(),
                    new_type,
                },
            )?;
        }
        if let Some(unique) = unique {
            self.enqueue(
                accepted,
                JobOperation::ChangeUniqueConstraint {
                    field_id: current.id,
                    column,
                    unique,
                },
            )?;
        }
        Ok(())
    }

    /// Delete a field's metadata and enqueue the column removal.
    pub fn delete_field(&self, field_id: u64) -> Result<Accepted> {
        let field = self.catalog.delete_field(field_id)?;
        let mut accepted = Accepted::new(field.table_id);
        self.remove_field(&mut accepted, field)?;
        Ok(accepted)
    }

    fn remove_field(&self, accepted: &mut Accepted, field: FieldDef) -> Result<()> {
        self.catalog.bump_generation(field.table_id)?;
        self.enqueue(
            accepted,
            JobOperation::RemoveField {
                field_id: field.id,
                column: field.name,
            },
        )
    }

    /// Replace a table's field list in one submission.
    ///
    /// Fields missing from `specs` are deleted, entries with an id update
    /// that field and entries without one create a field. The whole list is
    /// validated before anything is written.
    pub fn sync_fields(&self, table_id: u64, specs: &[FieldSpec]) -> Result<Accepted> {
        self.catalog.require_table(table_id)?;
        let existing: HashMap<u64, FieldDef> = self
            .catalog
            .fields_for_table(table_id)?
            .into_iter()
            .map(|f| (f.id, f))
            .collect();

        let mut names = HashSet::new();
        let mut kept = HashSet::new();
        for spec in specs {
            naming::validate_field_name(&spec.field.name)?;
            if !names.insert(spec.field.name.as_str()) {
                return Err(Error::Conflict(format!(
                    "field {:?} is listed twice",
                    spec.field.name
                )));
            }
            if let Some(id) = spec.id {
                if !existing.contains_key(&id) {
                    return Err(Error::not_found("field", id));
                }
                if !kept.insert(id) {
                    return Err(Error::Conflict(format!("field {id} is listed twice")));
                }
            }
        }

        let mut accepted = Accepted::new(table_id);

        let mut removed: Vec<&FieldDef> = existing.values().filter(|f| !kept.contains(&f.id)).collect();
        removed.sort_by_key(|f| f.id);
        for field in removed {
            let field = self.catalog.delete_field(field.id)?;
            self.remove_field(&mut accepted, field)?;
        }

        // Renames go first so a name freed by one entry can be taken by another.
        let mut updates: Vec<(&FieldDef, &NewField)> = specs
            .iter()
            .filter_map(|s| s.id.and_then(|id| existing.get(&id)).map(|f| (f, &s.field)))
            .collect();
        updates.sort_by_key(|(f, _)| f.id);
        self.rename_in_place(&mut accepted, &updates)?;
        for (current, desired) in &updates {
            let current = self.catalog.require_field(current.id)?;
            let update = FieldUpdate {
                name: None,
                field_type: Some(desired.field_type),
                required: Some(desired.required),
                unique: Some(desired.unique),
            };
            self.apply_field_update(&mut accepted, &current, &update)?;
        }

        for spec in specs.iter().filter(|s| s.id.is_none()) {
            self.create_field(&mut accepted, &spec.field)?;
        }

        tracing::info!(table_id, jobs = accepted.jobs.len(), "field list accepted");
        Ok(accepted)
    }

    /// Apply the renames of a bulk update. A field whose new name is still
    /// held by another field is parked under a temporary name first.
    fn rename_in_place(&self, accepted: &mut Accepted, updates: &[(&FieldDef, &NewField)]) -> Result<()> {
        let mut occupied: HashSet<String> = updates.iter().map(|(f, _)| f.name.clone()).collect();
        let targets: HashSet<&str> = updates.iter().map(|(_, n)| n.name.as_str()).collect();

        let mut parked = Vec::new();
        for (field, desired) in updates.iter().filter(|(f, n)| f.name != n.name) {
            let to = desired.name.as_str();
            occupied.remove(&field.name);
            if occupied.contains(to) {
                let temporary = parking_name(field.id, &occupied, &targets);
                self.rename(accepted, field, &temporary)?;
                occupied.insert(temporary);
                parked.push((field.id, to));
            } else {
                self.rename(accepted, field, to)?;
                occupied.insert(to.to_string());
            }
        }
        for (id, to) in parked {
            let field = self.catalog.require_field(id)?;
            self.rename(accepted, &field, to)?;
        }
        Ok(())
    }

    fn rename(&self, accepted: &mut Accepted, field: &FieldDef, to: &str) -> Result<()> {
        let update = FieldUpdate {
            name: Some(to.to_string()),
            ..FieldUpdate::default()
        };
        self.apply_field_update(accepted, field, &update)
    }

    /// Jobs of a table that have not reached a terminal state.
    pub fn pending_jobs(&self, table_id: u64) -> Result<Vec<Job>> {
        Ok(self
            .queue
            .jobs_for_table(table_id)?
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .collect())
    }
}

/// A temporary name for `field_id` that no current or requested field name uses.
fn parking_name(field_id: u64, occupied: &HashSet<String>, targets: &HashSet<&str>) -> String {
    let base = format!("tmp_{field_id}");
    let mut candidate = base.clone();
    let mut n = 0u32;
    while occupied.contains(&candidate) || targets.contains(candidate.as_str()) {
        n += 1;
        candidate = format!("{base}_{n}");
    }
    candidate
}
