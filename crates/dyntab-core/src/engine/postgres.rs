//! PostgreSQL engine.
//!
//! PostgreSQL alters column types natively (`ALTER COLUMN ... TYPE ... USING`)
//! inside a transaction, so no rebuild is needed. Values cross the wire as
//! text and are cast to the column's declared type in SQL.
//!
//! Enable with `--features postgres`.

use super::{
    ColumnDef, ColumnInfo, Engine, EngineError, EngineResult, FilterOp, IndexInfo, Row,
    RowFilter, SelectSpec, SortDirection,
};
use crate::naming::{self, quote_identifier as q, PRIMARY_KEY_COLUMN};
use crate::types::{CoercionError, FieldType, SqlValue};
use sqlx::postgres::{PgDatabaseError, PgPoolOptions};
use sqlx::{PgPool, Row as _};
use std::collections::HashMap;
use tokio::runtime::Runtime;

/// PostgreSQL-backed [`Engine`].
///
/// Owns a Tokio runtime and blocks on it, so it must not be called from
/// inside another runtime's async context.
pub struct PostgresEngine {
    pool: PgPool,
    rt: Runtime,
}

fn map_error(err: sqlx::Error) -> EngineError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if code == "40001" || code == "40P01" || code == "55P03" {
                EngineError::Busy(err.to_string())
            } else if code.starts_with("08") || code == "57P01" {
                EngineError::Connection(err.to_string())
            } else if ["0A", "22", "23", "25", "42"].iter().any(|class| code.starts_with(class)) {
                EngineError::Rejected(err.to_string())
            } else {
                EngineError::Other(err.to_string())
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => EngineError::Connection(err.to_string()),
        _ => EngineError::Other(err.to_string()),
    }
}

/// Map an error raised by a statement against `table`.
fn map_table_error(err: sqlx::Error, table: &str) -> EngineError {
    if let sqlx::Error::Database(db) = &err {
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
        let column = db
            .try_downcast_ref::<PgDatabaseError>()
            .and_then(|pg| pg.column())
            .map(String::from);
        match code.as_str() {
            "23502" => return EngineError::NotNullViolation { column },
            "23505" => {
                let column = db
                    .constraint()
                    .and_then(|c| naming::column_from_index_name(c, table))
                    .map(String::from)
                    .or_else(|| super::constraint_column(db.message(), table));
                return EngineError::UniqueViolation { column };
            }
            "42P01" => return EngineError::TableNotFound(table.to_string()),
            "42703" => {
                return EngineError::ColumnNotFound {
                    table: table.to_string(),
                    column: column.unwrap_or_else(|| db.message().to_string()),
                }
            }
            _ => {}
        }
    }
    map_error(err)
}

/// Whether a failed type conversion is a data problem rather than a transient one.
fn is_conversion_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|c| c.starts_with("22") || c == "42846" || c == "42804"),
        _ => false,
    }
}

fn sql_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => format!("{f:?}"),
        SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
    }
}

fn text_param(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        other => Some(other.to_string()),
    }
}

/// Interpret a value selected as `::text` according to its declared type.
fn parse_text(value: Option<String>, declared: &str) -> SqlValue {
    let Some(text) = value else {
        return SqlValue::Null;
    };
    match FieldType::from_declared_type(declared) {
        FieldType::Integer => match text.parse::<i64>() {
            Ok(i) => SqlValue::Integer(i),
            Err(_) => SqlValue::Text(text),
        },
        FieldType::Boolean => SqlValue::Bool(text == "t" || text == "true"),
        FieldType::Decimal | FieldType::Float => match text.parse::<f64>() {
            Ok(f) => SqlValue::Real(f),
            Err(_) => SqlValue::Text(text),
        },
        _ => SqlValue::Text(text),
    }
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

impl PostgresEngine {
    /// Connect to a database.
    pub fn connect(url: &str, max_connections: u32) -> EngineResult<Self> {
        let rt = Runtime::new().map_err(|e| EngineError::Connection(e.to_string()))?;
        let pool = rt
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url),
            )
            .map_err(map_error)?;
        Ok(Self { pool, rt })
    }

    fn type_for(field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::String | FieldType::File => "VARCHAR(255)",
            FieldType::Integer => "BIGINT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Text => "TEXT",
            FieldType::Date => "DATE",
            FieldType::Datetime => "TIMESTAMP",
            FieldType::Decimal => "DECIMAL(10,2)",
            FieldType::Float => "DOUBLE PRECISION",
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

    fn execute(&self, sql: &str) -> Result<(), sqlx::Error> {
        self.rt.block_on(async {
            sqlx::query(sql).execute(&self.pool).await?;
            Ok(())
        })
    }

    /// Declared types of a table's columns.
    fn column_types(&self, table: &str) -> EngineResult<HashMap<String, String>> {
        Ok(self
            .describe_columns(table)?
            .into_iter()
            .map(|c| (c.name, c.declared_type))
            .collect())
    }

    fn require_column(&self, table: &str, column: &str) -> EngineResult<ColumnInfo> {
        self.describe_columns(table)?
            .into_iter()
            .find(|c| c.name == column)
            .ok_or_else(|| EngineError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
    }

    /// Render a WHERE clause, numbering `$n` placeholders after the collected params.
    fn where_clause(
        filters: &[RowFilter],
        types: &HashMap<String, String>,
        params: &mut Vec<Option<String>>,
    ) -> String {
        if filters.is_empty() {
            return String::new();
        }
        let predicates: Vec<String> = filters
            .iter()
            .map(|f| match (f.op, &f.value) {
                (FilterOp::Eq, SqlValue::Null) => format!("{} IS NULL", q(&f.column)),
                (FilterOp::Eq, value) => {
                    params.push(text_param(value));
                    let declared = types.get(&f.column).map(String::as_str).unwrap_or("TEXT");
                    format!("{} = CAST(${} AS {declared})", q(&f.column), params.len())
                }
                (FilterOp::Contains, value) => {
                    params.push(Some(escape_like(&value.to_string())));
                    format!("CAST({} AS TEXT) LIKE ${}", q(&f.column), params.len())
                }
            })
            .collect();
        format!(" WHERE {}", predicates.join(" AND "))
    }

    fn duplicates(&self, table: &str, column: &str) -> EngineResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT {c} FROM {t} WHERE {c} IS NOT NULL GROUP BY {c} HAVING COUNT(*) > 1) dup",
            t = q(table),
            c = q(column),
        );
        let count: i64 = self
            .rt
            .block_on(sqlx::query_scalar(&sql).fetch_one(&self.pool))
            .map_err(|e| map_table_error(e, table))?;
        Ok(count as u64)
    }
}

impl Engine for PostgresEngine {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn supports_alter_column_type(&self) -> bool {
        true
    }

    fn declared_type(&self, field_type: FieldType) -> &'static str {
        Self::type_for(field_type)
    }

    fn column_matches_type(&self, column: &ColumnInfo, field_type: FieldType) -> bool {
        Self::type_for(FieldType::from_declared_type(&column.declared_type))
            == Self::type_for(field_type)
    }

    fn list_tables(&self) -> EngineResult<Vec<String>> {
        self.rt
            .block_on(
                sqlx::query_scalar(
                    "SELECT table_name::text FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
                     ORDER BY 1",
                )
                .fetch_all(&self.pool),
            )
            .map_err(map_error)
    }

    fn table_exists(&self, table: &str) -> EngineResult<bool> {
        self.rt
            .block_on(
                sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_name = $1)",
                )
                .bind(table)
                .fetch_one(&self.pool),
            )
            .map_err(map_error)
    }

    fn describe_columns(&self, table: &str) -> EngineResult<Vec<ColumnInfo>> {
        let rows = self
            .rt
            .block_on(
                sqlx::query(
                    "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), NOT a.attnotnull, \
                            pg_get_expr(d.adbin, d.adrelid), COALESCE(i.indisprimary, false) \
                     FROM pg_attribute a \
                     JOIN pg_class c ON c.oid = a.attrelid \
                     JOIN pg_namespace n ON n.oid = c.relnamespace \
                     LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
                     LEFT JOIN pg_index i ON i.indrelid = a.attrelid AND i.indisprimary \
                                          AND a.attnum = ANY(i.indkey::int2[]) \
                     WHERE n.nspname = current_schema() AND c.relname = $1 \
                       AND a.attnum > 0 AND NOT a.attisdropped \
                     ORDER BY a.attnum",
                )
                .bind(table)
                .fetch_all(&self.pool),
            )
            .map_err(map_error)?;
        if rows.is_empty() {
            return Err(EngineError::TableNotFound(table.to_string()));
        }
        rows.iter()
            .map(|row| -> Result<ColumnInfo, sqlx::Error> {
                Ok(ColumnInfo {
                    name: row.try_get(0)?,
                    declared_type: row.try_get(1)?,
                    nullable: row.try_get(2)?,
                    default: row.try_get(3)?,
                    primary_key: row.try_get(4)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(map_error)
    }

    fn describe_indexes(&self, table: &str) -> EngineResult<Vec<IndexInfo>> {
        if !self.table_exists(table)? {
            return Err(EngineError::TableNotFound(table.to_string()));
        }
        let rows = self
            .rt
            .block_on(
                sqlx::query(
                    "SELECT ic.relname::text, ix.indisunique, ix.indisprimary, \
                            ARRAY(SELECT a.attname::text \
                                  FROM unnest(ix.indkey::int2[]) WITH ORDINALITY k(attnum, ord) \
                                  JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = k.attnum \
                                  ORDER BY k.ord) \
                     FROM pg_index ix \
                     JOIN pg_class t ON t.oid = ix.indrelid \
                     JOIN pg_class ic ON ic.oid = ix.indexrelid \
                     JOIN pg_namespace n ON n.oid = t.relnamespace \
                     WHERE n.nspname = current_schema() AND t.relname = $1 \
                     ORDER BY 1",
                )
                .bind(table)
                .fetch_all(&self.pool),
            )
            .map_err(map_error)?;
        rows.iter()
            .map(|row| -> Result<IndexInfo, sqlx::Error> {
                Ok(IndexInfo {
                    name: row.try_get(0)?,
                    unique: row.try_get(1)?,
                    primary: row.try_get(2)?,
                    columns: row.try_get(3)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(map_error)
    }

    fn create_table(&self, table: &str, columns: &[ColumnDef]) -> EngineResult<()> {
        let mut definitions = vec![
            format!("{} BIGSERIAL PRIMARY KEY", q(PRIMARY_KEY_COLUMN)),
            format!("{} TIMESTAMP NOT NULL", q("created_at")),
            format!("{} TIMESTAMP NOT NULL", q("updated_at")),
        ];
        definitions.extend(columns.iter().map(Self::column_sql));
        self.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            q(table),
            definitions.join(", ")
        ))
        .map_err(map_error)?;
        tracing::debug!(table, columns = columns.len(), "created physical table");
        Ok(())
    }

    fn drop_table(&self, table: &str) -> EngineResult<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", q(table)))
            .map_err(map_error)
    }

    fn add_column(&self, table: &str, column: &ColumnDef) -> EngineResult<()> {
        if self.column_exists(table, &column.name)? {
            return Err(EngineError::ColumnExists {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
        self.execute(&format!(
            "ALTER TABLE {} ADD COLUMN {}",
            q(table),
            Self::column_sql(column)
        ))
        .map_err(|e| map_table_error(e, table))
    }

    fn drop_column(&self, table: &str, column: &str) -> EngineResult<()> {
        self.require_column(table, column)?;
        self.execute(&format!(
            "ALTER TABLE {} DROP COLUMN {}",
            q(table),
            q(column)
        ))
        .map_err(|e| map_table_error(e, table))
    }

    fn rename_column(&self, table: &str, old: &str, new: &str) -> EngineResult<()> {
        self.require_column(table, old)?;
        let rename_column = format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            q(table),
            q(old),
            q(new)
        );
        let rename_index = format!(
            "ALTER INDEX IF EXISTS {} RENAME TO {}",
            q(&naming::unique_index_name(table, old)),
            q(&naming::unique_index_name(table, new))
        );
        self.rt
            .block_on(async {
                let mut tx = self.pool.begin().await?;
                sqlx::query(&rename_column).execute(&mut *tx).await?;
                sqlx::query(&rename_index).execute(&mut *tx).await?;
                tx.commit().await
            })
            .map_err(|e| map_table_error(e, table))
    }

    fn change_column_type(&self, table: &str, column: &str, new_type: FieldType) -> EngineResult<()> {
        let current = self.require_column(table, column)?;
        if self.column_matches_type(&current, new_type) {
            return Ok(());
        }
        let declared = Self::type_for(new_type);
        let mut statements = vec![
            format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", q(table), q(column)),
            format!(
                "ALTER TABLE {t} ALTER COLUMN {c} TYPE {declared} USING CAST({c} AS {declared})",
                t = q(table),
                c = q(column),
            ),
        ];
        if current.default.is_some() {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                q(table),
                q(column),
                sql_literal(&new_type.backfill_default())
            ));
        }

        let result = self.rt.block_on(async {
            let mut tx = self.pool.begin().await?;
            for sql in &statements {
                sqlx::query(sql).execute(&mut *tx).await?;
            }
            tx.commit().await
        });
        match result {
            Ok(()) => {
                tracing::debug!(table, column, new_type = %new_type, "altered column type");
                Ok(())
            }
            Err(e) if is_conversion_failure(&e) => Err(EngineError::Coercion {
                table: table.to_string(),
                column: column.to_string(),
                source: CoercionError {
                    value: e.to_string(),
                    target: new_type,
                },
            }),
            Err(e) => Err(map_table_error(e, table)),
        }
    }

    fn find_duplicates(&self, table: &str, column: &str) -> EngineResult<u64> {
        self.require_column(table, column)?;
        self.duplicates(table, column)
    }

    fn add_unique_index(&self, table: &str, column: &str) -> EngineResult<()> {
        self.require_column(table, column)?;
        let groups = self.duplicates(table, column)?;
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
        self.execute(&sql).map_err(|e| match map_table_error(e, table) {
            EngineError::UniqueViolation { .. } => EngineError::DuplicateValues {
                table: table.to_string(),
                column: column.to_string(),
                groups: 1,
            },
            other => other,
        })
    }

    fn remove_unique_index(&self, table: &str, column: &str) -> EngineResult<bool> {
        let mut removed = false;
        for index in self.describe_indexes(table)? {
            let covers = index.columns.len() == 1 && index.columns[0] == column;
            if index.unique && !index.primary && covers {
                self.execute(&format!("DROP INDEX IF EXISTS {}", q(&index.name)))
                    .map_err(|e| map_table_error(e, table))?;
                removed = true;
            }
        }
        Ok(removed)
    }

    fn select_rows(&self, table: &str, spec: &SelectSpec) -> EngineResult<Vec<Row>> {
        let types = self.column_types(table)?;
        let mut params = Vec::new();
        let columns: Vec<String> = spec
            .columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT)", q(c)))
            .collect();
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            columns.join(", "),
            q(table),
            Self::where_clause(&spec.filters, &types, &mut params)
        );
        if let Some((column, direction)) = &spec.sort {
            let dir = match direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            sql.push_str(&format!(" ORDER BY {} {dir}, {} {dir}", q(column), q(PRIMARY_KEY_COLUMN)));
        }
        if let Some(limit) = spec.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if spec.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", spec.offset));
        }

        let rows = self
            .rt
            .block_on(async {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = query.bind(param);
                }
                query.fetch_all(&self.pool).await
            })
            .map_err(|e| map_table_error(e, table))?;

        rows.iter()
            .map(|row| {
                spec.columns
                    .iter()
                    .enumerate()
                    .map(|(i, name)| -> Result<(String, SqlValue), sqlx::Error> {
                        let declared = types.get(name).map(String::as_str).unwrap_or("TEXT");
                        let text: Option<String> = row.try_get(i)?;
                        Ok((name.clone(), parse_text(text, declared)))
                    })
                    .collect::<Result<Row, sqlx::Error>>()
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(map_error)
    }

    fn count_rows(&self, table: &str, filters: &[RowFilter]) -> EngineResult<u64> {
        let types = self.column_types(table)?;
        let mut params = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            q(table),
            Self::where_clause(filters, &types, &mut params)
        );
        let count: i64 = self
            .rt
            .block_on(async {
                let mut query = sqlx::query_scalar(&sql);
                for param in params {
                    query = query.bind(param);
                }
                query.fetch_one(&self.pool).await
            })
            .map_err(|e| map_table_error(e, table))?;
        Ok(count as u64)
    }

    fn insert_row(&self, table: &str, values: &Row) -> EngineResult<i64> {
        let types = self.column_types(table)?;
        let names: Vec<String> = values.iter().map(|(c, _)| q(c)).collect();
        let placeholders: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (c, _))| {
                let declared = types.get(c).map(String::as_str).unwrap_or("TEXT");
                format!("CAST(${} AS {declared})", i + 1)
            })
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            q(table),
            names.join(", "),
            placeholders.join(", "),
            q(PRIMARY_KEY_COLUMN)
        );
        self.rt
            .block_on(async {
                let mut query = sqlx::query_scalar(&sql);
                for (_, value) in values {
                    query = query.bind(text_param(value));
                }
                query.fetch_one(&self.pool).await
            })
            .map_err(|e| map_table_error(e, table))
    }

    fn update_row(&self, table: &str, id: i64, values: &Row) -> EngineResult<bool> {
        let types = self.column_types(table)?;
        let assignments: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (c, _))| {
                let declared = types.get(c).map(String::as_str).unwrap_or("TEXT");
                format!("{} = CAST(${} AS {declared})", q(c), i + 1)
            })
            .collect();
        let sql = if assignments.is_empty() {
            format!("SELECT 1 FROM {} WHERE {} = $1", q(table), q(PRIMARY_KEY_COLUMN))
        } else {
            format!(
                "UPDATE {} SET {} WHERE {} = ${}",
                q(table),
                assignments.join(", "),
                q(PRIMARY_KEY_COLUMN),
                values.len() + 1
            )
        };
        let affected = self
            .rt
            .block_on(async {
                let mut query = sqlx::query(&sql);
                for (_, value) in values {
                    query = query.bind(text_param(value));
                }
                query.bind(id).execute(&self.pool).await
            })
            .map_err(|e| map_table_error(e, table))?;
        Ok(affected.rows_affected() > 0)
    }

    fn delete_row(&self, table: &str, id: i64) -> EngineResult<bool> {
        let sql = format!("DELETE FROM {} WHERE {} = $1", q(table), q(PRIMARY_KEY_COLUMN));
        let affected = self
            .rt
            .block_on(sqlx::query(&sql).bind(id).execute(&self.pool))
            .map_err(|e| map_table_error(e, table))?;
        Ok(affected.rows_affected() > 0)
    }
}
