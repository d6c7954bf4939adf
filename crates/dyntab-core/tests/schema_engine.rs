//! End-to-end tests: metadata mutations through jobs to the physical schema.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use dyntab_core::jobs::JobOperation;
use dyntab_core::{
    Database, DatabaseConfig, FieldType, FieldUpdate, JobOutcome, JobStatus, NewField, NewTable,
    OrchestratorConfig, Record, RecordQuery,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn open() -> Database {
    Database::open(DatabaseConfig::temporary()).unwrap()
}

fn object(value: serde_json::Value) -> Record {
    value.as_object().unwrap().clone()
}

fn physical(db: &Database, table_id: u64) -> String {
    db.catalog().require_table(table_id).unwrap().physical_name()
}

fn user_columns(db: &Database, table_id: u64) -> BTreeSet<String> {
    db.engine()
        .describe_columns(&physical(db, table_id))
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .filter(|name| !dyntab_core::naming::is_system_column(name))
        .collect()
}

fn metadata_columns(db: &Database, table_id: u64) -> BTreeSet<String> {
    db.catalog()
        .fields_for_table(table_id)
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect()
}

fn field_id(db: &Database, table_id: u64, name: &str) -> u64 {
    db.catalog()
        .find_field_by_name(table_id, name)
        .unwrap()
        .unwrap()
        .id
}

fn all_records(db: &Database, table_id: u64) -> Vec<Record> {
    let query = RecordQuery::new()
        .sort_by("id", dyntab_core::engine::SortDirection::Asc)
        .paginate(1, 100);
    db.records().list(table_id, &query).unwrap().records
}

#[test]
fn test_columns_match_metadata_for_any_field_order() {
    let fields = [
        NewField::new("title", FieldType::String),
        NewField::new("body", FieldType::Text),
        NewField::new("score", FieldType::Integer).required(),
        NewField::new("slug", FieldType::String).unique(),
        NewField::new("published_on", FieldType::Date),
    ];
    let orders: [[usize; 5]; 3] = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3]];

    for order in orders {
        let db = open();
        let accepted = db.schema().create_table(&NewTable::new(1, "Posts")).unwrap();
        for i in order {
            db.schema().add_field(accepted.table_id, &fields[i]).unwrap();
        }
        let reports = db.orchestrator().run_until_idle().unwrap();
        assert!(reports.iter().all(|r| r.status == JobStatus::Succeeded));

        assert_eq!(
            user_columns(&db, accepted.table_id),
            metadata_columns(&db, accepted.table_id)
        );
        let physical = physical(&db, accepted.table_id);
        assert!(db.engine().has_unique_index(&physical, "slug").unwrap());
        assert!(!db.engine().has_unique_index(&physical, "title").unwrap());
    }
}

#[test]
fn test_columns_match_metadata_with_concurrent_workers() {
    let config = DatabaseConfig::temporary().with_orchestrator(
        OrchestratorConfig::default()
            .with_worker_count(4)
            .with_poll_interval(Duration::from_millis(5)),
    );
    let db = Database::open(config).unwrap();

    let mut table_ids = Vec::new();
    for name in ["Alpha", "Beta", "Gamma"] {
        let table = NewTable::new(1, name)
            .with_field(NewField::new("name", FieldType::String))
            .with_field(NewField::new("amount", FieldType::Decimal))
            .with_field(NewField::new("active", FieldType::Boolean));
        table_ids.push(db.schema().create_table(&table).unwrap().table_id);
    }

    let workers = db.start_workers().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while db.queue().pending_count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    workers.stop();

    assert_eq!(db.queue().pending_count(), 0);
    for table_id in table_ids {
        assert_eq!(user_columns(&db, table_id), metadata_columns(&db, table_id));
        assert_eq!(db.catalog().require_table(table_id).unwrap().schema_generation, 4);
    }
}

#[test]
fn test_rename_round_trip_restores_column() {
    let db = open();
    let accepted = db
        .schema()
        .create_table(&NewTable::new(1, "People").with_field(NewField::new("nickname", FieldType::String)))
        .unwrap();
    db.orchestrator().run_until_idle().unwrap();
    db.records()
        .insert(accepted.table_id, &object(json!({"nickname": "Bo"})))
        .unwrap();

    let id = field_id(&db, accepted.table_id, "nickname");
    let to = |name: &str| FieldUpdate {
        name: Some(name.to_string()),
        ..FieldUpdate::default()
    };
    db.schema().update_field(id, &to("alias")).unwrap();
    db.schema().update_field(id, &to("nickname")).unwrap();
    let reports = db.orchestrator().run_until_idle().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.outcome == Some(JobOutcome::Applied)));

    assert_eq!(
        user_columns(&db, accepted.table_id),
        BTreeSet::from(["nickname".to_string()])
    );
    let records = all_records(&db, accepted.table_id);
    assert_eq!(records[0]["nickname"], json!("Bo"));
}

#[test]
fn test_unique_on_duplicates_conflicts_and_keeps_metadata() {
    let db = open();
    let accepted = db
        .schema()
        .create_table(&NewTable::new(1, "Contacts").with_field(NewField::new("email", FieldType::String)))
        .unwrap();
    db.orchestrator().run_until_idle().unwrap();
    for _ in 0..2 {
        db.records()
            .insert(accepted.table_id, &object(json!({"email": "a@x.com"})))
            .unwrap();
    }

    let id = field_id(&db, accepted.table_id, "email");
    let update = FieldUpdate {
        unique: Some(true),
        ..FieldUpdate::default()
    };
    let queued = db.schema().update_field(id, &update).unwrap();
    assert_eq!(queued.jobs.len(), 1);

    let report = db.orchestrator().run_once().unwrap().unwrap();
    assert_eq!(report.status, JobStatus::FailedTerminal);
    assert_eq!(report.attempt, 1);
    assert!(report.error.unwrap().starts_with("conflict:"));

    let field = db.catalog().require_field(id).unwrap();
    assert!(!field.unique);
    assert_eq!(field.sync_failure.unwrap().job_id, report.job_id);
    assert!(!db
        .engine()
        .has_unique_index(&physical(&db, accepted.table_id), "email")
        .unwrap());

    // Terminal jobs do not block later work on the table.
    db.schema()
        .add_field(accepted.table_id, &NewField::new("phone", FieldType::String))
        .unwrap();
    let reports = db.orchestrator().run_until_idle().unwrap();
    assert_eq!(reports[0].status, JobStatus::Succeeded);
}

#[test]
fn test_dropping_absent_unique_constraint_is_noop() {
    let db = open();
    let accepted = db
        .schema()
        .create_table(&NewTable::new(1, "Tags").with_field(NewField::new("label", FieldType::String)))
        .unwrap();
    db.orchestrator().run_until_idle().unwrap();
    let generation = db.catalog().require_table(accepted.table_id).unwrap().schema_generation;

    let id = field_id(&db, accepted.table_id, "label");
    db.queue()
        .enqueue(
            accepted.table_id,
            JobOperation::ChangeUniqueConstraint {
                field_id: id,
                column: "label".into(),
                unique: false,
            },
            0,
        )
        .unwrap();
    let report = db.orchestrator().run_once().unwrap().unwrap();
    assert_eq!(report.outcome, Some(JobOutcome::AlreadyApplied));
    assert!(db.catalog().require_field(id).unwrap().is_in_sync());
    assert!(db.catalog().require_table(accepted.table_id).unwrap().schema_generation > generation);
}

#[test]
fn test_ensure_table_twice_keeps_one_set_of_system_columns() {
    let db = open();
    let accepted = db.schema().create_table(&NewTable::new(1, "Events")).unwrap();
    db.queue()
        .enqueue(accepted.table_id, JobOperation::EnsureTable, 0)
        .unwrap();

    let outcomes: Vec<_> = db
        .orchestrator()
        .run_until_idle()
        .unwrap()
        .into_iter()
        .map(|r| r.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![Some(JobOutcome::Applied), Some(JobOutcome::AlreadyApplied)]
    );

    let columns: Vec<String> = db
        .engine()
        .describe_columns(&physical(&db, accepted.table_id))
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(columns, vec!["id", "created_at", "updated_at"]);
}

#[test]
fn test_failed_type_change_leaves_table_unchanged() {
    let db = open();
    let accepted = db
        .schema()
        .create_table(
            &NewTable::new(1, "Members")
                .with_field(NewField::new("name", FieldType::String))
                .with_field(NewField::new("age", FieldType::String)),
        )
        .unwrap();
    db.orchestrator().run_until_idle().unwrap();
    for (name, age) in [("Ann", "31"), ("Bob", "abc"), ("Cy", "7")] {
        db.records()
            .insert(accepted.table_id, &object(json!({"name": name, "age": age})))
            .unwrap();
    }
    let physical = physical(&db, accepted.table_id);
    let columns_before = db.engine().describe_columns(&physical).unwrap();
    let records_before = all_records(&db, accepted.table_id);

    let id = field_id(&db, accepted.table_id, "age");
    let update = FieldUpdate {
        field_type: Some(FieldType::Integer),
        ..FieldUpdate::default()
    };
    db.schema().update_field(id, &update).unwrap();
    let report = db.orchestrator().run_once().unwrap().unwrap();
    assert_eq!(report.status, JobStatus::FailedTerminal);
    assert_eq!(report.attempt, 1);

    assert_eq!(db.engine().describe_columns(&physical).unwrap(), columns_before);
    assert_eq!(all_records(&db, accepted.table_id), records_before);
    assert!(!db
        .engine()
        .list_tables()
        .unwrap()
        .iter()
        .any(|t| dyntab_core::naming::is_temp_table_of(t, &physical)));

    let field = db.catalog().require_field(id).unwrap();
    assert_eq!(field.field_type, FieldType::String);
    assert!(!field.is_in_sync());
}

#[test]
fn test_successful_type_change_converts_values() {
    let db = open();
    let accepted = db
        .schema()
        .create_table(&NewTable::new(1, "Scores").with_field(NewField::new("points", FieldType::String)))
        .unwrap();
    db.orchestrator().run_until_idle().unwrap();
    db.records()
        .insert(accepted.table_id, &object(json!({"points": "12"})))
        .unwrap();

    let id = field_id(&db, accepted.table_id, "points");
    let update = FieldUpdate {
        field_type: Some(FieldType::Integer),
        ..FieldUpdate::default()
    };
    db.schema().update_field(id, &update).unwrap();
    db.orchestrator().run_until_idle().unwrap();

    assert_eq!(db.catalog().require_field(id).unwrap().field_type, FieldType::Integer);
    let records = all_records(&db, accepted.table_id);
    assert_eq!(records[0]["points"], json!(12));
}

#[test]
fn test_remove_field_never_created_is_noop() {
    let db = open();
    let accepted = db.schema().create_table(&NewTable::new(1, "Drafts")).unwrap();
    let added = db
        .schema()
        .add_field(accepted.table_id, &NewField::new("scratch", FieldType::Text))
        .unwrap();
    let id = field_id(&db, accepted.table_id, "scratch");
    let removed = db.schema().delete_field(id).unwrap();
    assert_eq!(added.jobs.len(), 1);
    assert_eq!(removed.jobs.len(), 1);

    let outcomes: Vec<_> = db
        .orchestrator()
        .run_until_idle()
        .unwrap()
        .into_iter()
        .map(|r| (r.operation, r.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("ensure_table", Some(JobOutcome::Applied)),
            ("add_field", Some(JobOutcome::Skipped)),
            ("remove_field", Some(JobOutcome::AlreadyApplied)),
        ]
    );
    assert!(user_columns(&db, accepted.table_id).is_empty());
}

#[test]
fn test_records_follow_schema_changes() {
    let db = open();
    let accepted = db
        .schema()
        .create_table(&NewTable::new(1, "Books").with_field(NewField::new("title", FieldType::String)))
        .unwrap();
    db.orchestrator().run_until_idle().unwrap();
    db.records()
        .insert(accepted.table_id, &object(json!({"title": "Dune"})))
        .unwrap();

    db.schema()
        .add_field(accepted.table_id, &NewField::new("pages", FieldType::Integer))
        .unwrap();
    db.orchestrator().run_until_idle().unwrap();

    let record = db
        .records()
        .insert(accepted.table_id, &object(json!({"title": "Emma", "pages": 474})))
        .unwrap();
    assert_eq!(record["pages"], json!(474));

    let id = field_id(&db, accepted.table_id, "title");
    db.schema().delete_field(id).unwrap();
    let err = db
        .records()
        .insert(accepted.table_id, &object(json!({"title": "Ulysses"})))
        .unwrap_err();
    assert!(matches!(err, dyntab_core::Error::Validation(_)));

    db.orchestrator().run_until_idle().unwrap();
    let records = all_records(&db, accepted.table_id);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| !r.contains_key("title")));
}

#[test]
fn test_delete_table_drops_physical_table() {
    let db = open();
    let accepted = db
        .schema()
        .create_table(&NewTable::new(1, "Temp").with_field(NewField::new("note", FieldType::Text)))
        .unwrap();
    db.orchestrator().run_until_idle().unwrap();
    let physical = physical(&db, accepted.table_id);

    db.schema().delete_table(accepted.table_id).unwrap();
    assert!(db.catalog().get_table(accepted.table_id).unwrap().is_none());
    db.orchestrator().run_until_idle().unwrap();
    assert!(!db.engine().table_exists(&physical).unwrap());
}
