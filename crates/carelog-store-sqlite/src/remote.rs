use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use carelog_core::row::{IDEMPOTENCY_KEY_COLUMN, ID_COLUMN, OWNER_COLUMN};
use carelog_core::{
    ColumnDef, ColumnType, Identity, RemoteError, RemoteId, RemoteRow, RemoteStore, SchemaObject,
    SchemaOperation, SchemaSnapshot,
};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{Number, Value};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::support::{configure, table_columns};

const BASELINE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identities (
  id TEXT PRIMARY KEY,
  idempotency_key TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS child_profiles (
  id TEXT PRIMARY KEY,
  idempotency_key TEXT NOT NULL UNIQUE,
  owner_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
  name TEXT NOT NULL,
  birth_date TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS observations (
  id TEXT PRIMARY KEY,
  idempotency_key TEXT NOT NULL UNIQUE,
  owner_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
  child_id TEXT NOT NULL REFERENCES child_profiles(id) ON DELETE CASCADE,
  category TEXT NOT NULL,
  value TEXT,
  notes TEXT,
  observed_at TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calendar_entries (
  id TEXT PRIMARY KEY,
  idempotency_key TEXT NOT NULL UNIQUE,
  owner_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
  child_id TEXT NOT NULL REFERENCES child_profiles(id) ON DELETE CASCADE,
  title TEXT NOT NULL,
  notes TEXT,
  scheduled_for TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS growth_memories (
  id TEXT PRIMARY KEY,
  idempotency_key TEXT NOT NULL UNIQUE,
  owner_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
  child_id TEXT NOT NULL REFERENCES child_profiles(id) ON DELETE CASCADE,
  title TEXT NOT NULL,
  content TEXT NOT NULL,
  occurred_on TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Remote store backed by a SQLite database, provisioned with the baseline tables.
///
/// Every call runs synchronously under one connection lock.
pub struct SqliteRemoteStore {
    conn: Mutex<Connection>,
}

fn rejected(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Rejected(err.to_string())
}

fn quote_ident(name: &str) -> Result<String, RemoteError> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RemoteError::Rejected(format!("invalid identifier {name:?}")));
    }
    Ok(format!("\"{name}\""))
}

fn column_type_sql(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text | ColumnType::Timestamp => "TEXT",
        ColumnType::Integer | ColumnType::Boolean => "INTEGER",
        ColumnType::Real => "REAL",
    }
}

fn column_sql(column: &ColumnDef) -> Result<String, RemoteError> {
    let mut sql = format!("{} {}", quote_ident(&column.name)?, column_type_sql(column.column_type));
    if column.primary_key {
        sql.push_str(" PRIMARY KEY");
    } else if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if column.unique {
        sql.push_str(" UNIQUE");
    }
    if let Some(table) = &column.references {
        sql.push_str(&format!(" REFERENCES {}(id) ON DELETE CASCADE", quote_ident(table)?));
    }
    Ok(sql)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || number.as_f64().map_or(SqlValue::Null, SqlValue::Real),
            SqlValue::Integer,
        ),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::Number(number.into()),
        ValueRef::Real(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

impl SqliteRemoteStore {
    /// Open the remote database and provision the baseline tables.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or provisioned.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        configure(&conn)?;
        conn.execute_batch(BASELINE_SQL).context("failed to provision baseline remote tables")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// # Errors
    /// See [`SqliteRemoteStore::open`].
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Column names of a remote table, empty when the table does not exist.
    ///
    /// # Errors
    /// Returns an error when the table layout cannot be read.
    pub fn columns(&self, table: &str) -> Result<Vec<String>> {
        table_columns(&self.conn.lock(), table)
    }

    /// Number of rows in a remote table, across all owners.
    ///
    /// # Errors
    /// Returns an error when the table name is invalid or the count fails.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table)?);
        let count = conn
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to count rows of {table}"))?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    fn known_columns(conn: &Connection, table: &str) -> Result<Vec<String>, RemoteError> {
        let columns = table_columns(conn, table).map_err(|err| rejected(format!("{err:#}")))?;
        if columns.is_empty() {
            return Err(RemoteError::Rejected(format!("unknown table {table}")));
        }
        Ok(columns)
    }

    fn checked_columns<'a>(
        conn: &Connection,
        table: &str,
        row: &'a RemoteRow,
    ) -> Result<Vec<(&'a String, &'a Value)>, RemoteError> {
        let known = Self::known_columns(conn, table)?;
        row.iter()
            .map(|(name, value)| {
                if name == ID_COLUMN || !known.iter().any(|column| column == name) {
                    return Err(RemoteError::Rejected(format!(
                        "{table} has no writable column {name}"
                    )));
                }
                Ok((name, value))
            })
            .collect()
    }

    fn insert_sync(&self, table: &str, row: &RemoteRow) -> Result<RemoteId, RemoteError> {
        let conn = self.conn.lock();
        let quoted_table = quote_ident(table)?;
        let columns = Self::checked_columns(&conn, table, row)?;
        let key = row.get(IDEMPOTENCY_KEY_COLUMN).and_then(Value::as_str).ok_or_else(|| {
            RemoteError::Rejected(format!("insert into {table} has no idempotency key"))
        })?;

        let existing = conn
            .query_row(
                &format!("SELECT id FROM {quoted_table} WHERE idempotency_key = ?1"),
                [key],
                |found| found.get::<_, String>(0),
            )
            .optional()
            .map_err(rejected)?;
        if let Some(id) = existing {
            tracing::debug!(table, id = %id, "idempotency key already present");
            return Ok(RemoteId(id));
        }

        let id = Ulid::new().to_string();
        let mut names = vec![quote_ident(ID_COLUMN)?];
        let mut values = vec![SqlValue::Text(id.clone())];
        for (name, value) in columns {
            names.push(quote_ident(name)?);
            values.push(json_to_sql(value));
        }
        let placeholders = (1..=values.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
        let sql = format!(
            "INSERT INTO {quoted_table} ({}) VALUES ({})",
            names.join(", "),
            placeholders.join(", ")
        );
        conn.execute(&sql, params_from_iter(values)).map_err(rejected)?;
        Ok(RemoteId(id))
    }

    fn update_sync(
        &self,
        table: &str,
        id: &RemoteId,
        columns: &RemoteRow,
    ) -> Result<(), RemoteError> {
        let conn = self.conn.lock();
        let quoted_table = quote_ident(table)?;
        let columns = Self::checked_columns(&conn, table, columns)?;
        if columns.is_empty() {
            return Err(RemoteError::Rejected(format!("update of {table}/{id} has no columns")));
        }

        let mut assignments = Vec::with_capacity(columns.len());
        let mut values = Vec::with_capacity(columns.len() + 1);
        for (index, (name, value)) in columns.into_iter().enumerate() {
            assignments.push(format!("{} = ?{}", quote_ident(name)?, index + 1));
            values.push(json_to_sql(value));
        }
        values.push(SqlValue::Text(id.to_string()));
        let sql = format!(
            "UPDATE {quoted_table} SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len()
        );
        let changed = conn.execute(&sql, params_from_iter(values)).map_err(rejected)?;
        if changed == 0 {
            return Err(RemoteError::NotFound { table: table.to_string(), id: id.to_string() });
        }
        Ok(())
    }

    fn delete_sync(&self, table: &str, id: &RemoteId) -> Result<(), RemoteError> {
        let conn = self.conn.lock();
        let sql = format!("DELETE FROM {} WHERE id = ?1", quote_ident(table)?);
        let changed = conn.execute(&sql, [id.as_str()]).map_err(rejected)?;
        if changed == 0 {
            return Err(RemoteError::NotFound { table: table.to_string(), id: id.to_string() });
        }
        Ok(())
    }

    fn select_all_sync(
        &self,
        table: &str,
        owner: &Identity,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let conn = self.conn.lock();
        let known = Self::known_columns(&conn, table)?;
        if !known.iter().any(|column| column == OWNER_COLUMN) {
            return Err(RemoteError::Rejected(format!("{table} has no owner column")));
        }
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 ORDER BY created_at, id",
            quote_ident(table)?,
            quote_ident(OWNER_COLUMN)?
        );
        let mut stmt = conn.prepare(&sql).map_err(rejected)?;
        let names = stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>();
        let mut rows = stmt.query([owner.as_str()]).map_err(rejected)?;
        let mut selected = Vec::new();
        while let Some(row) = rows.next().map_err(rejected)? {
            let mut remote_row = RemoteRow::new();
            for (index, name) in names.iter().enumerate() {
                let value = row.get_ref(index).map_err(rejected)?;
                remote_row.insert(name.clone(), sql_to_json(value));
            }
            selected.push(remote_row);
        }
        Ok(selected)
    }

    fn exists_sync(&self, table: &str, id: &RemoteId) -> Result<bool, RemoteError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", quote_ident(table)?);
        let exists =
            conn.query_row(&sql, [id.as_str()], |row| row.get::<_, i64>(0)).map_err(rejected)?;
        Ok(exists == 1)
    }

    fn execute_operation_sync(&self, operation: &SchemaOperation) -> Result<(), RemoteError> {
        let conn = self.conn.lock();
        let has_column = |table: &str, column: &str| -> Result<bool, RemoteError> {
            Ok(Self::known_columns(&conn, table)?.iter().any(|name| name == column))
        };

        let statements = match operation {
            SchemaOperation::AddColumn { table, column } => {
                if has_column(table, &column.name)? {
                    tracing::debug!(table, column = %column.name, "column already present");
                    return Ok(());
                }
                vec![format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(table)?,
                    column_sql(column)?
                )]
            }
            SchemaOperation::AddTable { table, columns } => {
                let definitions = columns.iter().map(column_sql).collect::<Result<Vec<_>, _>>()?;
                vec![format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    quote_ident(table)?,
                    definitions.join(", ")
                )]
            }
            SchemaOperation::AddIndex { table, name, columns, unique } => {
                let quoted = columns
                    .iter()
                    .map(|column| quote_ident(column))
                    .collect::<Result<Vec<_>, _>>()?;
                vec![format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {}({})",
                    if *unique { "UNIQUE " } else { "" },
                    quote_ident(name)?,
                    quote_ident(table)?,
                    quoted.join(", ")
                )]
            }
            SchemaOperation::ModifyColumn { table, column } => {
                return Err(RemoteError::Rejected(format!(
                    "cannot modify {table}.{} in place; express the change as a restructure",
                    column.name
                )));
            }
            SchemaOperation::DropColumn { table, column } => {
                if !has_column(table, column)? {
                    tracing::debug!(table, column, "column already absent");
                    return Ok(());
                }
                vec![format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    quote_ident(table)?,
                    quote_ident(column)?
                )]
            }
            SchemaOperation::DropTable { table } => {
                vec![format!("DROP TABLE IF EXISTS {}", quote_ident(table)?)]
            }
            SchemaOperation::DropIndex { name } => {
                vec![format!("DROP INDEX IF EXISTS {}", quote_ident(name)?)]
            }
            SchemaOperation::RenameTable { from, to } => {
                vec![format!("ALTER TABLE {} RENAME TO {}", quote_ident(from)?, quote_ident(to)?)]
            }
            SchemaOperation::Restructure { statements } => statements.clone(),
        };

        let tx = conn.unchecked_transaction().map_err(rejected)?;
        for statement in &statements {
            tx.execute_batch(statement).map_err(rejected)?;
        }
        tx.commit().map_err(rejected)
    }

    fn schema_metadata_sync(&self) -> Result<SchemaSnapshot, RemoteError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT type, name, tbl_name, sql FROM sqlite_master
                 WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
                 ORDER BY type, name",
            )
            .map_err(rejected)?;
        let objects = stmt
            .query_map([], |row| {
                Ok(SchemaObject {
                    object_type: row.get(0)?,
                    name: row.get(1)?,
                    table: row.get(2)?,
                    definition: row.get(3)?,
                })
            })
            .map_err(rejected)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rejected)?;
        Ok(SchemaSnapshot { captured_at: OffsetDateTime::now_utc(), objects })
    }
}

#[async_trait]
impl RemoteStore for SqliteRemoteStore {
    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteId, RemoteError> {
        self.insert_sync(table, &row)
    }

    async fn update(
        &self,
        table: &str,
        id: &RemoteId,
        columns: RemoteRow,
    ) -> Result<(), RemoteError> {
        self.update_sync(table, id, &columns)
    }

    async fn delete(&self, table: &str, id: &RemoteId) -> Result<(), RemoteError> {
        self.delete_sync(table, id)
    }

    async fn select_all(
        &self,
        table: &str,
        owner: &Identity,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.select_all_sync(table, owner)
    }

    async fn exists(&self, table: &str, id: &RemoteId) -> Result<bool, RemoteError> {
        self.exists_sync(table, id)
    }

    async fn execute_schema_operation(
        &self,
        operation: &SchemaOperation,
    ) -> Result<(), RemoteError> {
        self.execute_operation_sync(operation)
    }

    async fn schema_metadata(&self) -> Result<SchemaSnapshot, RemoteError> {
        self.schema_metadata_sync()
    }
}
