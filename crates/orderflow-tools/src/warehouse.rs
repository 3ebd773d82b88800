//! DuckDB-backed warehouse connection.

use duckdb::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::ToolError;
use crate::frame::DataFrame;
use crate::table::{quote_identifier, validate_identifier};

const DEFAULT_SCHEMA: &str = "main";

/// Where a warehouse keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseTarget {
    InMemory,
    File(PathBuf),
}

/// A shared warehouse connection.
///
/// DuckDB connections are synchronous; callers hop onto the blocking pool
/// (see [`Warehouse::run_blocking`]) before touching it from async code.
#[derive(Clone)]
pub struct Warehouse {
    conn: Arc<Mutex<Connection>>,
    target: WarehouseTarget,
}

impl std::fmt::Debug for Warehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warehouse").field("target", &self.target).finish()
    }
}

impl Warehouse {
    /// Open an in-memory warehouse.
    pub fn in_memory() -> Result<Self, ToolError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            ToolError::ConnectionError(format!("Failed to create in-memory DuckDB: {}", e))
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            target: WarehouseTarget::InMemory,
        })
    }

    /// Open (or create) a warehouse database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ToolError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            ToolError::ConnectionError(format!(
                "Failed to open database {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            target: WarehouseTarget::File(path.to_path_buf()),
        })
    }

    pub fn from_target(target: &WarehouseTarget) -> Result<Self, ToolError> {
        match target {
            WarehouseTarget::InMemory => Self::in_memory(),
            WarehouseTarget::File(path) => Self::open(path),
        }
    }

    pub fn target(&self) -> &WarehouseTarget {
        &self.target
    }

    /// Run `f` with exclusive access to the underlying connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, ToolError>,
    ) -> Result<T, ToolError> {
        let mut guard = self.conn.lock().map_err(|e| {
            ToolError::ConnectionError(format!("Failed to acquire connection lock: {}", e))
        })?;
        f(&mut guard)
    }

    /// Run a closure against this warehouse on the blocking thread pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, ToolError>
    where
        T: Send + 'static,
        F: FnOnce(&Warehouse) -> Result<T, ToolError> + Send + 'static,
    {
        let warehouse = self.clone();
        tokio::task::spawn_blocking(move || f(&warehouse))
            .await
            .map_err(|e| ToolError::Database(format!("Task join error: {}", e)))?
    }

    /// Execute one or more statements without results.
    pub fn execute_batch(&self, sql: &str) -> Result<(), ToolError> {
        tracing::trace!(sql = %sql, "execute_batch");
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    /// Execute a single statement, returning the affected row count.
    pub fn execute(&self, sql: &str) -> Result<usize, ToolError> {
        tracing::trace!(sql = %sql, "execute");
        self.with_conn(|conn| Ok(conn.execute(sql, params![])?))
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, ToolError> {
        let (schema, table) = split_name(name)?;
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT count(*) FROM information_schema.tables \
                 WHERE table_schema = ? AND table_name = ?",
                params![schema, table],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Column names of a table in ordinal order.
    pub fn columns(&self, name: &str) -> Result<Vec<String>, ToolError> {
        let (schema, table) = split_name(name)?;
        let columns = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
            )?;
            let rows = stmt.query_map(params![schema, table], |row| row.get::<_, String>(0))?;
            let mut columns = Vec::new();
            for row in rows {
                columns.push(row?);
            }
            Ok(columns)
        })?;

        if columns.is_empty() {
            return Err(ToolError::TableNotFound(name.to_string()));
        }
        Ok(columns)
    }

    /// Column names and types of a table in ordinal order.
    pub fn column_types(&self, name: &str) -> Result<Vec<(String, String)>, ToolError> {
        let (schema, table) = split_name(name)?;
        let columns = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
            )?;
            let rows = stmt.query_map(params![schema, table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut columns = Vec::new();
            for row in rows {
                columns.push(row?);
            }
            Ok(columns)
        })?;

        if columns.is_empty() {
            return Err(ToolError::TableNotFound(name.to_string()));
        }
        Ok(columns)
    }

    pub fn row_count(&self, name: &str) -> Result<usize, ToolError> {
        validate_identifier(name)?;
        let sql = format!("SELECT count(*) FROM {}", quote_identifier(name));
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(&sql, params![], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Output column names of a query, without running it.
    pub fn describe(&self, query: &str) -> Result<Vec<String>, ToolError> {
        let sql = format!("DESCRIBE {}", query);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![], |row| row.get::<_, String>(0))?;
            let mut columns = Vec::new();
            for row in rows {
                columns.push(row?);
            }
            Ok(columns)
        })
    }

    /// Run a query and collect the result set.
    pub fn query_frame(&self, query: &str) -> Result<DataFrame, ToolError> {
        let start = std::time::Instant::now();
        let query = query.trim().trim_end_matches(';');
        let columns = self.describe(query)?;
        let width = columns.len();

        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(query)?;
            let mapped = stmt.query_map(params![], |row| {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    let value: duckdb::types::Value = row.get(idx)?;
                    values.push(duckdb_value_to_json(&value));
                }
                Ok(values)
            })?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            Ok(rows)
        })?;

        tracing::debug!(
            rows = rows.len(),
            columns = width,
            duration_ms = start.elapsed().as_millis() as u64,
            "Query materialized"
        );
        Ok(DataFrame::new(columns, rows))
    }

    /// Materialize a whole table, in stored row order.
    pub fn read_table(&self, name: &str) -> Result<DataFrame, ToolError> {
        if !self.table_exists(name)? {
            return Err(ToolError::TableNotFound(name.to_string()));
        }
        self.query_frame(&format!("SELECT * FROM {}", quote_identifier(name)))
    }

    pub fn drop_table(&self, name: &str) -> Result<(), ToolError> {
        validate_identifier(name)?;
        self.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_identifier(name)))
    }
}

fn split_name(name: &str) -> Result<(String, String), ToolError> {
    validate_identifier(name)?;
    match name.rsplit_once('.') {
        Some((schema, table)) => Ok((schema.to_string(), table.to_string())),
        None => Ok((DEFAULT_SCHEMA.to_string(), name.to_string())),
    }
}

/// Single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Convert DuckDB Value to JSON.
///
/// Dates become `YYYY-MM-DD` strings and timestamps RFC 3339 strings so a
/// frame reads the same way the warehouse prints it.
pub fn duckdb_value_to_json(value: &duckdb::types::Value) -> serde_json::Value {
    use duckdb::types::{TimeUnit, Value};
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::json!(*b),
        Value::TinyInt(n) => serde_json::json!(*n),
        Value::SmallInt(n) => serde_json::json!(*n),
        Value::Int(n) => serde_json::json!(*n),
        Value::BigInt(n) => serde_json::json!(*n),
        Value::HugeInt(n) => serde_json::json!(n.to_string()),
        Value::UTinyInt(n) => serde_json::json!(*n),
        Value::USmallInt(n) => serde_json::json!(*n),
        Value::UInt(n) => serde_json::json!(*n),
        Value::UBigInt(n) => serde_json::json!(*n),
        Value::Float(f) => serde_json::json!(*f),
        Value::Double(f) => serde_json::json!(*f),
        Value::Decimal(d) => serde_json::json!(d.to_string()),
        Value::Text(s) => serde_json::json!(s),
        Value::Enum(s) => serde_json::json!(s),
        Value::Date32(days) => chrono::DateTime::from_timestamp(i64::from(*days) * 86_400, 0)
            .map(|dt| serde_json::json!(dt.date_naive().to_string()))
            .unwrap_or_else(|| serde_json::json!(*days)),
        Value::Timestamp(unit, t) => {
            let micros = match unit {
                TimeUnit::Second => t.saturating_mul(1_000_000),
                TimeUnit::Millisecond => t.saturating_mul(1_000),
                TimeUnit::Microsecond => *t,
                TimeUnit::Nanosecond => t / 1_000,
            };
            chrono::DateTime::from_timestamp_micros(micros)
                .map(|dt| serde_json::json!(dt.to_rfc3339()))
                .unwrap_or_else(|| serde_json::json!(*t))
        }
        Value::List(list) => {
            serde_json::Value::Array(list.iter().map(duckdb_value_to_json).collect())
        }
        other => serde_json::json!(format!("{:?}", other)),
    }
}
