//! Embedded SQLite engine.
//!
//! SQLite cannot alter a column's type, so type changes rebuild the table:
//! snapshot, create a scratch table with the new type, copy rows with
//! coercion, move the indexes, drop the original and rename. All of it runs
//! in one `BEGIN IMMEDIATE` transaction.

use super::{
    constraint_column, ColumnDef, ColumnInfo, Engine, EngineError, EngineResult, FilterOp,
    IndexInfo, Row, RowFilter, SelectSpec, SortDirection,
};
use crate::config::SqliteConfig;
use crate::naming::{self, quote_identifier as q, PRIMARY_KEY_COLUMN};
use crate::types::{CoercionError, FieldType, SqlValue};
use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{ffi, params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

/// SQLite-backed [`Engine`].
///
/// Statements are serialized through a single connection.
pub struct SqliteEngine {
    conn: Mutex<Connection>,
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Text(hex::encode(bytes)),
    }
}

fn sql_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => format!("{f:?}"),
        SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        SqlValue::Bool(b) => i64::from(*b).to_string(),
    }
}

fn map_error(err: rusqlite::Error) -> EngineError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                EngineError::Busy(err.to_string())
            }
            ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt => EngineError::Connection(err.to_string()),
            ErrorCode::Unknown
            | ErrorCode::ConstraintViolation
            | ErrorCode::TypeMismatch
            | ErrorCode::ApiMisuse
            | ErrorCode::TooBig
            | ErrorCode::ParameterOutOfRange
            | ErrorCode::ReadOnly
            | ErrorCode::PermissionDenied
            | ErrorCode::AuthorizationForStatementDenied => EngineError::Rejected(err.to_string()),
            _ => EngineError::Other(err.to_string()),
        },
        // Binding and conversion errors raised by rusqlite itself.
        _ => EngineError::Rejected(err.to_string()),
    }
}

/// Map an error raised by a row statement against `table`.
fn map_row_error(err: rusqlite::Error, table: &str) -> EngineError {
    if let rusqlite::Error::SqliteFailure(e, msg) = &err {
        let message = msg.as_deref().unwrap_or_default();
        if e.code == ErrorCode::ConstraintViolation {
            let column = constraint_column(message, table);
            return match e.extended_code {
                ffi::SQLITE_CONSTRAINT_NOTNULL => EngineError::NotNullViolation { column },
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    EngineError::UniqueViolation { column }
                }
                _ => EngineError::Rejected(err.to_string()),
            };
        }
        if message.starts_with("no such table") {
            return EngineError::TableNotFound(table.to_string());
        }
        if let Some(column) = message.strip_prefix("no such column: ") {
            return EngineError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            };
        }
    }
    map_error(err)
}

fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Render a WHERE clause, pushing its parameters.
fn where_clause(filters: &[RowFilter], params: &mut Vec<SqlValue>) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let predicates: Vec<String> = filters
        .iter()
        .map(|f| match (f.op, &f.value) {
            (FilterOp::Eq, SqlValue::Null) => format!("{} IS NULL", q(&f.column)),
            (FilterOp::Eq, value) => {
                params.push(value.clone());
                format!("{} = ?", q(&f.column))
            }
            (FilterOp::Contains, value) => {
                params.push(SqlValue::Text(escape_like(&value.to_string())));
                format!("CAST({} AS TEXT) LIKE ? ESCAPE '\\'", q(&f.column))
            }
        })
        .collect();
    format!(" WHERE {}", predicates.join(" AND "))
}

fn table_exists_on(conn: &Connection, table: &str) -> EngineResult<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(map_error)
}

fn columns_on(conn: &Connection, table: &str) -> EngineResult<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )
        .map_err(map_error)?;
    let columns = stmt
        .query_map([table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                declared_type: row.get(1)?,
                nullable: row.get::<_, i64>(2)? == 0,
                default: row.get(3)?,
                primary_key: row.get::<_, i64>(4)? > 0,
            })
        })
        .map_err(map_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_error)?;
    if columns.is_empty() {
        return Err(EngineError::TableNotFound(table.to_string()));
    }
    Ok(columns)
}

fn indexes_on(conn: &Connection, table: &str) -> EngineResult<Vec<IndexInfo>> {
    let mut list = conn
        .prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1)")
        .map_err(map_error)?;
    let entries = list
        .query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(map_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_error)?;

    let mut info = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
        .map_err(map_error)?;
    let mut indexes = Vec::with_capacity(entries.len());
    for (name, unique, origin) in entries {
        let columns = info
            .query_map([&name], |row| row.get::<_, String>(0))
            .map_err(map_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_error)?;
        indexes.push(IndexInfo {
            name,
            columns,
            unique,
            primary: origin == "pk",
        });
    }
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(indexes)
}

fn duplicates_on(conn: &Connection, table: &str, column: &str) -> EngineResult<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM (SELECT {c} FROM {t} WHERE {c} IS NOT NULL GROUP BY {c} HAVING COUNT(*) > 1)",
        t = q(table),
        c = q(column),
    );
    let count: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .map_err(|e| map_row_error(e, table))?;
    Ok(count as u64)
}

fn require_column(conn: &Connection, table: &str, column: &str) -> EngineResult<ColumnInfo> {
    columns_on(conn, table)?
        .into_iter()
        .find(|c| c.name == column)
        .ok_or_else(|| EngineError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        })
}

/// Index DDL for an index snapshot, targeting `table`.
fn index_sql(index: &IndexInfo, name: &str, table: &str) -> String {
    let columns: Vec<String> = index.columns.iter().map(|c| q(c)).collect();
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        q(name),
        q(table),
        columns.join(", ")
    )
}

impl SqliteEngine {
    /// Open the engine.
    pub fn open(config: &SqliteConfig) -> EngineResult<Self> {
        let conn = match &config.path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(map_error)?;
        conn.busy_timeout(config.busy_timeout).map_err(map_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> EngineResult<Self> {
        Self::open(&SqliteConfig::in_memory())
    }

    fn type_for(field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::String | FieldType::File => "VARCHAR(255)",
            FieldType::Integer => "INTEGER",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Text => "TEXT",
            FieldType::Date => "DATE",
            FieldType::Datetime => "DATETIME",
            FieldType::Decimal => "DECIMAL(10,2)",
            FieldType::Float => "FLOAT",
        }
    }

    fn column_sql(column: &ColumnDef) -> String {
        let mut sql = format!("{} {}", q(&column.name), Self::type_for(column.field_type));
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&sql_literal(default));
        }
        sql
    }

    /// Rebuild `table` with `column` converted to `new_type`.
    fn rebuild(
        conn: &mut Connection,
        table: &str,
        column: &str,
        new_type: FieldType,
    ) -> EngineResult<()> {
        let temp = naming::temp_table_name(table, &hex::encode(rand::random::<[u8; 2]>()));
        let result = Self::rebuild_in_transaction(conn, table, &temp, column, new_type);
        if let Err(e) = &result {
            // The rollback already discards the scratch table; make sure of it
            // in case the failure came from COMMIT itself.
            if let Err(cleanup) = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", q(&temp))) {
                tracing::warn!(table, temp = %temp, error = %cleanup, "failed to drop scratch table");
            }
            tracing::debug!(table, column, error = %e, "table rebuild rolled back");
        }
        result
    }

    fn rebuild_in_transaction(
        conn: &mut Connection,
        table: &str,
        temp: &str,
        column: &str,
        new_type: FieldType,
    ) -> EngineResult<()> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_error)?;

        // 1. Snapshot.
        let columns = columns_on(&tx, table)?;
        let target = columns
            .iter()
            .find(|c| c.name == column)
            .ok_or_else(|| EngineError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })?;
        let source_type = FieldType::from_declared_type(&target.declared_type);
        let indexes: Vec<IndexInfo> = indexes_on(&tx, table)?
            .into_iter()
            .filter(|i| !i.primary)
            .collect();
        tracing::debug!(table, temp, columns = columns.len(), indexes = indexes.len(), "rebuild snapshot taken");

        // 2. Scratch table with the target column retyped.
        let definitions: Vec<String> = columns
            .iter()
            .map(|c| {
                if c.primary_key {
                    return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL", q(&c.name));
                }
                let (declared, default) = if c.name == column {
                    let default = c
                        .default
                        .as_ref()
                        .map(|_| sql_literal(&new_type.backfill_default()));
                    (Self::type_for(new_type).to_string(), default)
                } else {
                    (c.declared_type.clone(), c.default.clone())
                };
                let mut sql = format!("{} {}", q(&c.name), declared);
                if !c.nullable {
                    sql.push_str(" NOT NULL");
                }
                if let Some(default) = default {
                    sql.push_str(" DEFAULT ");
                    sql.push_str(&default);
                }
                sql
            })
            .collect();
        tx.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            q(temp),
            definitions.join(", ")
        ))
        .map_err(map_error)?;

        // 3. Copy rows, converting the target column.
        let names: Vec<String> = columns.iter().map(|c| q(&c.name)).collect();
        let target_idx = columns.iter().position(|c| c.name == column).unwrap_or(0);
        let target_nullable = target.nullable;
        let placeholders = vec!["?"; columns.len()].join(", ");
        let mut copied = 0u64;
        {
            let mut select = tx
                .prepare(&format!("SELECT {} FROM {}", names.join(", "), q(table)))
                .map_err(map_error)?;
            let mut insert = tx
                .prepare(&format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    q(temp),
                    names.join(", "),
                    placeholders
                ))
                .map_err(map_error)?;
            let mut rows = select.query([]).map_err(map_error)?;
            while let Some(row) = rows.next().map_err(map_error)? {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    values.push(value_from_ref(row.get_ref(i).map_err(map_error)?));
                }
                let mut current = std::mem::replace(&mut values[target_idx], SqlValue::Null);
                if source_type == FieldType::Boolean {
                    if let SqlValue::Integer(i) = current {
                        current = SqlValue::Bool(i != 0);
                    }
                }
                let coercion_error = |value: &SqlValue| CoercionError {
                    value: value.to_string(),
                    target: new_type,
                };
                let converted = match current.coerce(new_type) {
                    // A blank text value in a NOT NULL column has no counterpart.
                    Ok(SqlValue::Null) if !target_nullable && !current.is_null() => {
                        Err(coercion_error(&current))
                    }
                    other => other,
                };
                values[target_idx] = converted.map_err(|source| EngineError::Coercion {
                    table: table.to_string(),
                    column: column.to_string(),
                    source,
                })?;
                insert
                    .execute(params_from_iter(values.iter()))
                    .map_err(|e| map_row_error(e, temp))?;
                copied += 1;
            }
        }
        tracing::debug!(table, temp, rows = copied, "rebuild rows copied");

        // 4. Move indexes. Names are schema-wide, so the originals go first.
        for index in &indexes {
            let name = if index.name.starts_with("sqlite_autoindex") {
                naming::unique_index_name(table, &index.columns.join("_"))
            } else {
                tx.execute_batch(&format!("DROP INDEX {}", q(&index.name)))
                    .map_err(map_error)?;
                index.name.clone()
            };
            tx.execute_batch(&index_sql(index, &name, temp))
                .map_err(map_error)?;
        }

        // The AUTOINCREMENT high-water mark goes away with the original.
        let sequence: Option<i64> = tx
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_error)?;

        // 5. Drop the original, 6. rename the scratch table into place.
        tx.execute_batch(&format!(
            "DROP TABLE {}; ALTER TABLE {} RENAME TO {}",
            q(table),
            q(temp),
            q(table)
        ))
        .map_err(map_error)?;

        if let Some(seq) = sequence {
            let updated = tx
                .execute(
                    "UPDATE sqlite_sequence SET seq = MAX(seq, ?1) WHERE name = ?2",
                    rusqlite::params![seq, table],
                )
                .map_err(map_error)?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
                    rusqlite::params![table, seq],
                )
                .map_err(map_error)?;
            }
        }

        tx.commit().map_err(map_error)?;
        tracing::debug!(table, column, new_type = %new_type, "rebuild committed");
        Ok(())
    }
}

impl Engine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_alter_column_type(&self) -> bool {
        false
    }

    fn declared_type(&self, field_type: FieldType) -> &'static str {
        Self::type_for(field_type)
    }

    fn list_tables(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(map_error)?;
        let names = stmt
            .query_map([], |row| row.get(0))
            .map_err(map_error)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(map_error)?;
        Ok(names)
    }

    fn table_exists(&self, table: &str) -> EngineResult<bool> {
        table_exists_on(&self.conn.lock(), table)
    }

    fn describe_columns(&self, table: &str) -> EngineResult<Vec<ColumnInfo>> {
        columns_on(&self.conn.lock(), table)
    }

    fn describe_indexes(&self, table: &str) -> EngineResult<Vec<IndexInfo>> {
        let conn = self.conn.lock();
        if !table_exists_on(&conn, table)? {
            return Err(EngineError::TableNotFound(table.to_string()));
        }
        indexes_on(&conn, table)
    }

    fn create_table(&self, table: &str, columns: &[ColumnDef]) -> EngineResult<()> {
        let mut definitions = vec![
            format!("{} INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL", q(PRIMARY_KEY_COLUMN)),
            format!("{} DATETIME NOT NULL", q("created_at")),
            format!("{} DATETIME NOT NULL", q("updated_at")),
        ];
        definitions.extend(columns.iter().map(Self::column_sql));
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            q(table),
            definitions.join(", ")
        );
        self.conn.lock().execute_batch(&sql).map_err(map_error)?;
        tracing::debug!(table, columns = columns.len(), "created physical table");
        Ok(())
    }

    fn drop_table(&self, table: &str) -> EngineResult<()> {
        self.conn
            .lock()
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", q(table)))
            .map_err(map_error)
    }

    fn add_column(&self, table: &str, column: &ColumnDef) -> EngineResult<()> {
        let conn = self.conn.lock();
        if columns_on(&conn, table)?.iter().any(|c| c.name == column.name) {
            return Err(EngineError::ColumnExists {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {}",
            q(table),
            Self::column_sql(column)
        ))
        .map_err(map_error)
    }

    fn drop_column(&self, table: &str, column: &str) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_error)?;
        require_column(&tx, table, column)?;
        // SQLite refuses to drop an indexed column.
        for index in indexes_on(&tx, table)? {
            if !index.primary && index.columns.iter().any(|c| c == column) {
                tx.execute_batch(&format!("DROP INDEX IF EXISTS {}", q(&index.name)))
                    .map_err(map_error)?;
            }
        }
        tx.execute_batch(&format!(
            "ALTER TABLE {} DROP COLUMN {}",
            q(table),
            q(column)
        ))
        .map_err(map_error)?;
        tx.commit().map_err(map_error)
    }

    fn rename_column(&self, table: &str, old: &str, new: &str) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_error)?;
        require_column(&tx, table, old)?;
        tx.execute_batch(&format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            q(table),
            q(old),
            q(new)
        ))
        .map_err(map_error)?;

        // Keep derived index names in step with the column.
        let stale = naming::unique_index_name(table, old);
        if let Some(index) = indexes_on(&tx, table)?.into_iter().find(|i| i.name == stale) {
            let renamed = naming::unique_index_name(table, new);
            tx.execute_batch(&format!("DROP INDEX {}", q(&index.name)))
                .map_err(map_error)?;
            tx.execute_batch(&index_sql(&index, &renamed, table))
                .map_err(map_error)?;
        }
        tx.commit().map_err(map_error)
    }

    fn change_column_type(&self, table: &str, column: &str, new_type: FieldType) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let current = require_column(&conn, table, column)?;
        if current.declared_type.eq_ignore_ascii_case(Self::type_for(new_type)) {
            return Ok(());
        }
        Self::rebuild(&mut conn, table, column, new_type)
    }

    fn find_duplicates(&self, table: &str, column: &str) -> EngineResult<u64> {
        let conn = self.conn.lock();
        require_column(&conn, table, column)?;
        duplicates_on(&conn, table, column)
    }

    fn add_unique_index(&self, table: &str, column: &str) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_error)?;
        require_column(&tx, table, column)?;
        let groups = duplicates_on(&tx, table, column)?;
        if groups > 0 {
            return Err(EngineError::DuplicateValues {
                table: table.to_string(),
                column: column.to_string(),
                groups,
            });
        }
        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
            q(&naming::unique_index_name(table, column)),
            q(table),
            q(column)
        );
        if let Err(e) = tx.execute_batch(&sql) {
            return Err(match map_row_error(e, table) {
                EngineError::UniqueViolation { .. } => EngineError::DuplicateValues {
                    table: table.to_string(),
                    column: column.to_string(),
                    groups: 1,
                },
                other => other,
            });
        }
        tx.commit().map_err(map_error)
    }

    fn remove_unique_index(&self, table: &str, column: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        if !table_exists_on(&conn, table)? {
            return Err(EngineError::TableNotFound(table.to_string()));
        }
        let mut removed = false;
        for index in indexes_on(&conn, table)? {
            let covers = index.columns.len() == 1 && index.columns[0] == column;
            if index.unique && !index.primary && covers && !index.name.starts_with("sqlite_autoindex") {
                conn.execute_batch(&format!("DROP INDEX IF EXISTS {}", q(&index.name)))
                    .map_err(map_error)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    fn select_rows(&self, table: &str, spec: &SelectSpec) -> EngineResult<Vec<Row>> {
        let mut params = Vec::new();
        let columns: Vec<String> = spec.columns.iter().map(|c| q(c)).collect();
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            columns.join(", "),
            q(table),
            where_clause(&spec.filters, &mut params)
        );
        if let Some((column, direction)) = &spec.sort {
            let dir = match direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            sql.push_str(&format!(" ORDER BY {} {dir}, {} {dir}", q(column), q(PRIMARY_KEY_COLUMN)));
        }
        if spec.limit.is_some() || spec.offset > 0 {
            let limit = spec.limit.map(|l| l as i64).unwrap_or(-1);
            sql.push_str(&format!(" LIMIT {limit} OFFSET {}", spec.offset));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(|e| map_row_error(e, table))?;
        let mut rows = stmt
            .query(params_from_iter(params.iter()))
            .map_err(|e| map_row_error(e, table))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_error)? {
            let mut values = Vec::with_capacity(spec.columns.len());
            for (i, name) in spec.columns.iter().enumerate() {
                values.push((name.clone(), value_from_ref(row.get_ref(i).map_err(map_error)?)));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn count_rows(&self, table: &str, filters: &[RowFilter]) -> EngineResult<u64> {
        let mut params = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            q(table),
            where_clause(filters, &mut params)
        );
        let count: i64 = self
            .conn
            .lock()
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
            .map_err(|e| map_row_error(e, table))?;
        Ok(count as u64)
    }

    fn insert_row(&self, table: &str, values: &Row) -> EngineResult<i64> {
        let names: Vec<String> = values.iter().map(|(c, _)| q(c)).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            q(table),
            names.join(", "),
            placeholders
        );
        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))
            .map_err(|e| map_row_error(e, table))?;
        Ok(conn.last_insert_rowid())
    }

    fn update_row(&self, table: &str, id: i64, values: &Row) -> EngineResult<bool> {
        let conn = self.conn.lock();
        if values.is_empty() {
            let sql = format!("SELECT 1 FROM {} WHERE {} = ?1", q(table), q(PRIMARY_KEY_COLUMN));
            return conn
                .query_row(&sql, [id], |_| Ok(()))
                .optional()
                .map(|found| found.is_some())
                .map_err(|e| map_row_error(e, table));
        }
        let assignments: Vec<String> = values.iter().map(|(c, _)| format!("{} = ?", q(c))).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            q(table),
            assignments.join(", "),
            q(PRIMARY_KEY_COLUMN)
        );
        let id = SqlValue::Integer(id);
        let params = values.iter().map(|(_, v)| v).chain(std::iter::once(&id));
        let changed = conn
            .execute(&sql, params_from_iter(params))
            .map_err(|e| map_row_error(e, table))?;
        Ok(changed > 0)
    }

    fn delete_row(&self, table: &str, id: i64) -> EngineResult<bool> {
        let sql = format!("DELETE FROM {} WHERE {} = ?1", q(table), q(PRIMARY_KEY_COLUMN));
        let changed = self
            .conn
            .lock()
            .execute(&sql, [id])
            .map_err(|e| map_row_error(e, table))?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NOW: &str = "2025-01-01 00:00:00.000000";

    fn engine_with(columns: &[ColumnDef]) -> SqliteEngine {
        let engine = SqliteEngine::in_memory().unwrap();
        engine.create_table("dyn_1", columns).unwrap();
        engine
    }

    fn insert(engine: &SqliteEngine, column: &str, value: SqlValue) -> i64 {
        engine
            .insert_row(
                "dyn_1",
                &vec![
                    ("created_at".to_string(), SqlValue::Text(NOW.into())),
                    ("updated_at".to_string(), SqlValue::Text(NOW.into())),
                    (column.to_string(), value),
                ],
            )
            .unwrap()
    }

    fn column_names(engine: &SqliteEngine) -> Vec<String> {
        engine
            .describe_columns("dyn_1")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[test]
    fn test_create_table_is_idempotent() {
        let engine = engine_with(&[]);
        engine.create_table("dyn_1", &[]).unwrap();
        assert_eq!(column_names(&engine), vec!["id", "created_at", "updated_at"]);
        let id = engine.describe_columns("dyn_1").unwrap().remove(0);
        assert!(id.primary_key);
    }

    #[test]
    fn test_describe_missing_table() {
        let engine = SqliteEngine::in_memory().unwrap();
        assert!(matches!(
            engine.describe_columns("dyn_404"),
            Err(EngineError::TableNotFound(_))
        ));
        assert!(!engine.table_exists("dyn_404").unwrap());
    }

    #[test]
    fn test_add_required_column_backfills() {
        let engine = engine_with(&[ColumnDef::new("name", FieldType::String)]);
        insert(&engine, "name", SqlValue::Text("a".into()));

        engine
            .add_column("dyn_1", &ColumnDef::new("qty", FieldType::Integer).not_null())
            .unwrap();
        let qty = engine
            .describe_columns("dyn_1")
            .unwrap()
            .into_iter()
            .find(|c| c.name == "qty")
            .unwrap();
        assert!(!qty.nullable);
        assert_eq!(qty.declared_type, "INTEGER");

        let rows = engine
            .select_rows(
                "dyn_1",
                &SelectSpec {
                    columns: vec!["qty".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rows, vec![vec![("qty".to_string(), SqlValue::Integer(0))]]);

        assert!(matches!(
            engine.add_column("dyn_1", &ColumnDef::new("qty", FieldType::Integer)),
            Err(EngineError::ColumnExists { .. })
        ));
    }

    #[test]
    fn test_rename_and_drop_column() {
        let engine = engine_with(&[ColumnDef::new("a", FieldType::String)]);
        engine.add_unique_index("dyn_1", "a").unwrap();
        engine.rename_column("dyn_1", "a", "b").unwrap();

        assert!(engine.column_exists("dyn_1", "b").unwrap());
        assert!(engine.has_unique_index("dyn_1", "b").unwrap());
        let names: Vec<String> = engine
            .describe_indexes("dyn_1")
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["uidx_dyn_1_b"]);

        engine.drop_column("dyn_1", "b").unwrap();
        assert!(!engine.column_exists("dyn_1", "b").unwrap());
        assert!(matches!(
            engine.drop_column("dyn_1", "b"),
            Err(EngineError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_unique_index_rejects_duplicates() {
        let engine = engine_with(&[ColumnDef::new("email", FieldType::String)]);
        insert(&engine, "email", SqlValue::Text("a@x.io".into()));
        insert(&engine, "email", SqlValue::Text("a@x.io".into()));
        insert(&engine, "email", SqlValue::Null);
        insert(&engine, "email", SqlValue::Null);

        assert_eq!(engine.find_duplicates("dyn_1", "email").unwrap(), 1);
        let err = engine.add_unique_index("dyn_1", "email").unwrap_err();
        assert!(matches!(err, EngineError::DuplicateValues { groups: 1, .. }));
        assert!(!engine.has_unique_index("dyn_1", "email").unwrap());
    }

    #[test]
    fn test_unique_index_ignores_nulls() {
        let engine = engine_with(&[ColumnDef::new("email", FieldType::String)]);
        insert(&engine, "email", SqlValue::Null);
        insert(&engine, "email", SqlValue::Null);

        engine.add_unique_index("dyn_1", "email").unwrap();
        assert!(engine.has_unique_index("dyn_1", "email").unwrap());
        assert!(engine.remove_unique_index("dyn_1", "email").unwrap());
        assert!(!engine.remove_unique_index("dyn_1", "email").unwrap());
    }

    #[test]
    fn test_change_type_rebuilds_with_data_and_indexes() {
        let engine = engine_with(&[
            ColumnDef::new("age", FieldType::String),
            ColumnDef::new("code", FieldType::String),
        ]);
        engine.add_unique_index("dyn_1", "code").unwrap();
        insert(&engine, "age", SqlValue::Text("41".into()));
        insert(&engine, "age", SqlValue::Text(" 7 ".into()));

        engine
            .change_column_type("dyn_1", "age", FieldType::Integer)
            .unwrap();

        let age = engine
            .describe_columns("dyn_1")
            .unwrap()
            .into_iter()
            .find(|c| c.name == "age")
            .unwrap();
        assert_eq!(age.declared_type, "INTEGER");
        assert!(engine.has_unique_index("dyn_1", "code").unwrap());
        assert_eq!(engine.list_tables().unwrap(), vec!["dyn_1"]);

        let rows = engine
            .select_rows(
                "dyn_1",
                &SelectSpec {
                    columns: vec!["id".into(), "age".into()],
                    sort: Some(("id".into(), SortDirection::Asc)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rows[0][1].1, SqlValue::Integer(41));
        assert_eq!(rows[1][1].1, SqlValue::Integer(7));

        // New rows keep getting fresh ids after the rebuild.
        let next = insert(&engine, "age", SqlValue::Integer(1));
        assert_eq!(next, 3);
    }

    #[test]
    fn test_change_type_failure_leaves_table_intact() {
        let engine = engine_with(&[ColumnDef::new("age", FieldType::String)]);
        engine.add_unique_index("dyn_1", "age").unwrap();
        insert(&engine, "age", SqlValue::Text("12".into()));
        insert(&engine, "age", SqlValue::Text("abc".into()));

        let err = engine
            .change_column_type("dyn_1", "age", FieldType::Integer)
            .unwrap_err();
        assert!(matches!(err, EngineError::Coercion { .. }));

        let age = engine
            .describe_columns("dyn_1")
            .unwrap()
            .into_iter()
            .find(|c| c.name == "age")
            .unwrap();
        assert_eq!(age.declared_type, "VARCHAR(255)");
        assert!(engine.has_unique_index("dyn_1", "age").unwrap());
        assert_eq!(engine.list_tables().unwrap(), vec!["dyn_1"]);
        assert_eq!(engine.count_rows("dyn_1", &[]).unwrap(), 2);
    }

    #[test]
    fn test_change_type_keeps_autoincrement_high_water_mark() {
        let engine = engine_with(&[ColumnDef::new("age", FieldType::String)]);
        for age in ["1", "2", "3", "4"] {
            insert(&engine, "age", SqlValue::Text(age.into()));
        }
        assert!(engine.delete_row("dyn_1", 4).unwrap());
        assert!(engine.delete_row("dyn_1", 3).unwrap());

        engine
            .change_column_type("dyn_1", "age", FieldType::Integer)
            .unwrap();

        let next = insert(&engine, "age", SqlValue::Integer(5));
        assert_eq!(next, 5);
    }

    #[test]
    fn test_change_type_rejects_blank_in_required_column() {
        let engine = engine_with(&[
            ColumnDef::new("age", FieldType::String),
            ColumnDef::new("code", FieldType::String).not_null(),
        ]);
        // `code` is backfilled with ''.
        insert(&engine, "age", SqlValue::Text("3".into()));

        let err = engine
            .change_column_type("dyn_1", "code", FieldType::Integer)
            .unwrap_err();
        assert!(matches!(err, EngineError::Coercion { ref column, .. } if column == "code"));
        assert!(matches!(
            crate::error::Error::from(err),
            crate::error::Error::SchemaApply(crate::error::SchemaApplyError::Terminal(_))
        ));

        let code = engine
            .describe_columns("dyn_1")
            .unwrap()
            .into_iter()
            .find(|c| c.name == "code")
            .unwrap();
        assert_eq!(code.declared_type, "VARCHAR(255)");
        assert_eq!(engine.list_tables().unwrap(), vec!["dyn_1"]);
    }

    #[test]
    fn test_change_type_maps_blank_to_null_when_nullable() {
        let engine = engine_with(&[ColumnDef::new("age", FieldType::String)]);
        insert(&engine, "age", SqlValue::Text(String::new()));
        engine
            .change_column_type("dyn_1", "age", FieldType::Integer)
            .unwrap();
        let rows = engine
            .select_rows(
                "dyn_1",
                &SelectSpec {
                    columns: vec!["age".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rows[0][0].1, SqlValue::Null);
    }

    #[test]
    fn test_error_classification() {
        let engine = engine_with(&[]);
        let err = engine
            .conn
            .lock()
            .execute_batch("SELEC 1")
            .map_err(map_error)
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        let busy = rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(matches!(map_error(busy), EngineError::Busy(_)));
    }

    #[test]
    fn test_change_type_to_same_type_is_noop() {
        let engine = engine_with(&[ColumnDef::new("n", FieldType::Integer)]);
        engine
            .change_column_type("dyn_1", "n", FieldType::Integer)
            .unwrap();
        assert_eq!(engine.list_tables().unwrap(), vec!["dyn_1"]);
    }

    #[test]
    fn test_boolean_to_string_rebuild() {
        let engine = engine_with(&[ColumnDef::new("flag", FieldType::Boolean)]);
        insert(&engine, "flag", SqlValue::Bool(true));
        engine
            .change_column_type("dyn_1", "flag", FieldType::String)
            .unwrap();
        let rows = engine
            .select_rows(
                "dyn_1",
                &SelectSpec {
                    columns: vec!["flag".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rows[0][0].1, SqlValue::Text("true".into()));
    }

    #[test]
    fn test_row_constraint_errors() {
        let engine = engine_with(&[
            ColumnDef::new("email", FieldType::String),
            ColumnDef::new("name", FieldType::String).not_null(),
        ]);
        engine.add_unique_index("dyn_1", "email").unwrap();
        insert(&engine, "email", SqlValue::Text("a@x.io".into()));

        let dup = engine.insert_row(
            "dyn_1",
            &vec![
                ("created_at".to_string(), SqlValue::Text(NOW.into())),
                ("updated_at".to_string(), SqlValue::Text(NOW.into())),
                ("email".to_string(), SqlValue::Text("a@x.io".into())),
            ],
        );
        assert!(matches!(
            dup,
            Err(EngineError::UniqueViolation { column: Some(ref c) }) if c == "email"
        ));

        let blank = engine.update_row(
            "dyn_1",
            1,
            &vec![("name".to_string(), SqlValue::Null)],
        );
        assert!(matches!(
            blank,
            Err(EngineError::NotNullViolation { column: Some(ref c) }) if c == "name"
        ));
    }

    #[test]
    fn test_select_filters_sort_and_paging() {
        let engine = engine_with(&[ColumnDef::new("name", FieldType::String)]);
        for name in ["alpha", "beta", "alphabet", "gamma_1", "gamma%"] {
            insert(&engine, "name", SqlValue::Text(name.into()));
        }

        let contains = [RowFilter::contains("name", "alpha")];
        assert_eq!(engine.count_rows("dyn_1", &contains).unwrap(), 2);
        let literal_percent = [RowFilter::contains("name", "a%")];
        assert_eq!(engine.count_rows("dyn_1", &literal_percent).unwrap(), 1);
        let eq = [RowFilter::eq("name", SqlValue::Text("beta".into()))];
        assert_eq!(engine.count_rows("dyn_1", &eq).unwrap(), 1);

        let page = engine
            .select_rows(
                "dyn_1",
                &SelectSpec {
                    columns: vec!["name".into()],
                    sort: Some(("name".into(), SortDirection::Desc)),
                    limit: Some(2),
                    offset: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        let names: Vec<SqlValue> = page.into_iter().map(|mut r| r.remove(0).1).collect();
        assert_eq!(
            names,
            vec![SqlValue::Text("gamma%".into()), SqlValue::Text("beta".into())]
        );
    }

    #[test]
    fn test_update_and_delete_row() {
        let engine = engine_with(&[ColumnDef::new("name", FieldType::String)]);
        let id = insert(&engine, "name", SqlValue::Text("a".into()));

        assert!(engine
            .update_row("dyn_1", id, &vec![("name".to_string(), SqlValue::Text("b".into()))])
            .unwrap());
        assert!(!engine.update_row("dyn_1", 99, &vec![]).unwrap());
        assert!(engine.delete_row("dyn_1", id).unwrap());
        assert!(!engine.delete_row("dyn_1", id).unwrap());
    }

    #[test]
    fn test_drop_table() {
        let engine = engine_with(&[]);
        engine.drop_table("dyn_1").unwrap();
        engine.drop_table("dyn_1").unwrap();
        assert!(engine.list_tables().unwrap().is_empty());
    }
}
