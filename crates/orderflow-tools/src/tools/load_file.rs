//! Load a CSV file from object storage into a warehouse table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::context::{RunContext, TableSource};
use crate::error::ToolError;
use crate::registry::Operator;
use crate::result::StepOutput;
use crate::storage::ensure_readable;
use crate::table::{quote_identifier, File, Table};
use crate::warehouse::{quote_literal, Warehouse};

/// What to do when the output table already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    /// Append rows; the file header must match the existing columns.
    #[default]
    Append,
    /// Drop the table and recreate it from the file.
    Replace,
}

/// Load step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadFile {
    /// File to read (CSV with header row).
    pub input_file: File,

    /// Destination table, named or temporary.
    pub output_table: Table,

    #[serde(default)]
    pub if_exists: IfExists,
}

impl LoadFile {
    pub fn new(input_file: File, output_table: Table) -> Self {
        Self {
            input_file,
            output_table,
            if_exists: IfExists::Append,
        }
    }

    pub fn with_if_exists(mut self, if_exists: IfExists) -> Self {
        self.if_exists = if_exists;
        self
    }
}

#[async_trait]
impl Operator for LoadFile {
    fn kind(&self) -> &'static str {
        "load_file"
    }

    fn inputs(&self) -> Vec<TableSource> {
        Vec::new()
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StepOutput, ToolError> {
        let storage = ctx
            .connections
            .storage(&self.input_file.conn_id)
            .map_err(|e| ToolError::SourceUnavailable(e.to_string()))?;
        let path = storage.resolve(&self.input_file.path)?;
        ensure_readable(&path).await?;

        let warehouse = ctx.connections.warehouse(&self.output_table.conn_id)?;
        let table = self.output_table.materialize();
        let name = table.require_name()?.to_string();
        ctx.temp_tables.register(&table);

        tracing::debug!(
            step = %ctx.step,
            file = %self.input_file,
            path = %path.display(),
            table = %table,
            "Loading file"
        );

        let if_exists = self.if_exists;
        let loaded = warehouse
            .run_blocking(move |wh| load_csv(wh, &path, &name, if_exists))
            .await?;

        tracing::info!(
            step = %ctx.step,
            table = %table,
            rows = loaded,
            "File loaded"
        );
        Ok(StepOutput::Table(table))
    }
}

/// Load a CSV file into `table`, returning the number of rows written.
pub fn load_csv(
    wh: &Warehouse,
    path: &Path,
    table: &str,
    if_exists: IfExists,
) -> Result<usize, ToolError> {
    let source = format!(
        "read_csv_auto({}, header = true)",
        quote_literal(&path.to_string_lossy())
    );
    let select = format!("SELECT * FROM {}", source);

    let header = wh.describe(&select).map_err(|e| {
        ToolError::SourceUnavailable(format!("cannot read {} as CSV: {}", path.display(), e))
    })?;

    let mut exists = wh.table_exists(table)?;
    if exists && if_exists == IfExists::Replace {
        wh.drop_table(table)?;
        exists = false;
    }
    let ident = quote_identifier(table);

    if exists {
        let existing = wh.columns(table)?;
        if !same_columns(&existing, &header) {
            return Err(ToolError::SchemaMismatch(format!(
                "table {} has columns [{}], file {} has [{}]",
                table,
                existing.join(", "),
                path.display(),
                header.join(", ")
            )));
        }
        wh.execute(&format!("INSERT INTO {} {}", ident, select))
            .map_err(|e| match e {
                ToolError::TypeMismatch(msg) => ToolError::SchemaMismatch(msg),
                other => other,
            })
    } else {
        wh.execute_batch(&format!("CREATE TABLE {} AS {}", ident, select))?;
        wh.row_count(table)
    }
}

fn same_columns(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::storage::LocalStorage;
    use chrono::NaiveDate;
    use std::sync::Arc;

    const ORDERS: &str = "order_id,customer_id,purchase_date,amount,type
1,10,2022-01-01,200,A
2,11,2022-01-02,100,B
3,10,2022-01-03,151,A
";

    fn setup(csv: &str) -> (tempfile::TempDir, Warehouse, RunContext) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("bucket");
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::write(bucket.join("orders.csv"), csv).unwrap();

        let wh = Warehouse::in_memory().unwrap();
        let mut registry = ConnectionRegistry::new();
        registry.register_storage("aws_default", LocalStorage::new(dir.path()));
        registry.register_warehouse("wh", wh.clone());

        let ctx = RunContext::new(
            "run-1",
            "test",
            NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            Arc::new(registry),
        )
        .for_step("load_file", Default::default());
        (dir, wh, ctx)
    }

    fn orders_file() -> File {
        File::new("s3://bucket/orders.csv", "aws_default")
    }

    #[tokio::test]
    async fn test_load_into_temp_table() {
        let (_dir, wh, ctx) = setup(ORDERS);
        let op = LoadFile::new(orders_file(), Table::temp("wh"));

        let out = op.execute(&ctx).await.unwrap();
        let table = out.as_table().unwrap().clone();
        let name = table.require_name().unwrap();

        assert!(table.is_temporary());
        assert_eq!(wh.row_count(name).unwrap(), 3);
        assert_eq!(
            wh.columns(name).unwrap(),
            vec!["order_id", "customer_id", "purchase_date", "amount", "type"]
        );
        assert_eq!(ctx.temp_tables.snapshot(), vec![table]);
    }

    #[tokio::test]
    async fn test_load_appends_to_existing_table() {
        let (_dir, wh, ctx) = setup(ORDERS);
        let op = LoadFile::new(orders_file(), Table::named("orders", "wh"));

        op.execute(&ctx).await.unwrap();
        op.execute(&ctx).await.unwrap();
        assert_eq!(wh.row_count("orders").unwrap(), 6);
        // named tables are never scheduled for cleanup
        assert!(ctx.temp_tables.snapshot().is_empty());

        let replace = op.clone().with_if_exists(IfExists::Replace);
        replace.execute(&ctx).await.unwrap();
        assert_eq!(wh.row_count("orders").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_load_schema_mismatch() {
        let (_dir, wh, ctx) = setup(ORDERS);
        wh.execute_batch("CREATE TABLE orders (id INTEGER, name VARCHAR)")
            .unwrap();

        let op = LoadFile::new(orders_file(), Table::named("orders", "wh"));
        let err = op.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::SchemaMismatch(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let (_dir, _wh, ctx) = setup(ORDERS);
        let op = LoadFile::new(
            File::new("s3://bucket/missing.csv", "aws_default"),
            Table::temp("wh"),
        );
        let err = op.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::SourceUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_load_unknown_connections() {
        let (_dir, _wh, ctx) = setup(ORDERS);

        let op = LoadFile::new(File::new("s3://bucket/orders.csv", "nope"), Table::temp("wh"));
        assert!(matches!(
            op.execute(&ctx).await.unwrap_err(),
            ToolError::SourceUnavailable(_)
        ));

        let op = LoadFile::new(orders_file(), Table::temp("snowflake_default"));
        assert!(matches!(
            op.execute(&ctx).await.unwrap_err(),
            ToolError::ConnectionError(_)
        ));
    }

    #[test]
    fn test_same_columns() {
        let a = vec!["Order_ID".to_string(), "amount".to_string()];
        let b = vec!["order_id".to_string(), "amount".to_string()];
        assert!(same_columns(&a, &b));
        assert!(!same_columns(&a, &b[..1]));
    }
}
