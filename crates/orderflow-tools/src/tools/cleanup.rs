//! Drop the temporary tables a run created.

use async_trait::async_trait;

use crate::context::{RunContext, TableSource};
use crate::error::ToolError;
use crate::registry::Operator;
use crate::result::{CleanupReport, StepOutput};
use crate::table::Table;

/// Cleanup step.
///
/// With no explicit table list every temporary table registered during the
/// run is dropped. Named tables are never dropped, even when listed.
#[derive(Debug, Clone, Default)]
pub struct Cleanup {
    pub tables: Option<Vec<TableSource>>,
}

impl Cleanup {
    pub fn all() -> Self {
        Self { tables: None }
    }

    pub fn tables(tables: Vec<TableSource>) -> Self {
        Self {
            tables: Some(tables),
        }
    }

    fn candidates(&self, ctx: &RunContext) -> Vec<Table> {
        match &self.tables {
            None => ctx.temp_tables.snapshot(),
            Some(sources) => sources
                .iter()
                .filter_map(|source| match ctx.resolve_table(source) {
                    Ok(table) => Some(table),
                    Err(e) => {
                        // upstream failed before producing a table; nothing to drop
                        tracing::debug!(step = %ctx.step, error = %e, "Skipping unresolved table");
                        None
                    }
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Operator for Cleanup {
    fn kind(&self) -> &'static str {
        "cleanup"
    }

    fn inputs(&self) -> Vec<TableSource> {
        self.tables.clone().unwrap_or_default()
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StepOutput, ToolError> {
        let mut report = CleanupReport::default();

        for table in self.candidates(ctx) {
            if !table.is_temporary() {
                tracing::debug!(step = %ctx.step, table = %table, "Keeping named table");
                report.skipped.push(table);
                continue;
            }

            let result = match (ctx.connections.warehouse(&table.conn_id), table.require_name()) {
                (Ok(warehouse), Ok(name)) => {
                    let name = name.to_string();
                    warehouse.run_blocking(move |wh| wh.drop_table(&name)).await
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            };

            match result {
                Ok(()) => {
                    tracing::debug!(step = %ctx.step, table = %table, "Dropped temporary table");
                    ctx.temp_tables.forget(&table);
                    report.dropped.push(table);
                }
                Err(e) => {
                    tracing::warn!(step = %ctx.step, table = %table, error = %e, "Failed to drop temporary table");
                    report.failed.push((table, e.to_string()));
                }
            }
        }

        tracing::info!(
            step = %ctx.step,
            dropped = report.dropped.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Cleanup finished"
        );

        if report.is_clean() {
            Ok(StepOutput::Cleanup(report))
        } else {
            Err(ToolError::CleanupFailed(
                report.failed.iter().map(|(t, _)| t.to_string()).collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::warehouse::Warehouse;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn setup() -> (Warehouse, RunContext) {
        let wh = Warehouse::in_memory().unwrap();
        wh.execute_batch(
            "CREATE TABLE customers_table (customer_id INTEGER);
             CREATE TABLE reporting_table (order_id INTEGER);",
        )
        .unwrap();
        let mut registry = ConnectionRegistry::new();
        registry.register_warehouse("wh", wh.clone());
        let ctx = RunContext::new(
            "run-1",
            "test",
            NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            Arc::new(registry),
        )
        .for_step("cleanup", HashMap::new());
        (wh, ctx)
    }

    fn temp(wh: &Warehouse, ctx: &RunContext) -> Table {
        let table = Table::temp("wh").materialize();
        wh.execute_batch(&format!("CREATE TABLE {} (x INTEGER)", table.sql_identifier().unwrap()))
            .unwrap();
        ctx.temp_tables.register(&table);
        table
    }

    #[tokio::test]
    async fn test_drops_temporary_tables_only() {
        let (wh, ctx) = setup();
        let a = temp(&wh, &ctx);
        let b = temp(&wh, &ctx);

        let out = Cleanup::all().execute(&ctx).await.unwrap();
        let StepOutput::Cleanup(report) = out else {
            panic!("expected cleanup report");
        };
        assert_eq!(report.dropped, vec![a.clone(), b.clone()]);
        assert!(!wh.table_exists(a.require_name().unwrap()).unwrap());
        assert!(!wh.table_exists(b.require_name().unwrap()).unwrap());
        assert!(wh.table_exists("customers_table").unwrap());
        assert!(wh.table_exists("reporting_table").unwrap());
        assert!(ctx.temp_tables.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_list_never_drops_named_tables() {
        let (wh, ctx) = setup();
        let a = temp(&wh, &ctx);
        let op = Cleanup::tables(vec![
            TableSource::Table(Table::named("customers_table", "wh")),
            TableSource::Table(a.clone()),
            TableSource::Upstream("never_ran".into()),
        ]);

        let out = op.execute(&ctx).await.unwrap();
        let StepOutput::Cleanup(report) = out else {
            panic!("expected cleanup report");
        };
        assert_eq!(report.dropped, vec![a]);
        assert_eq!(report.skipped, vec![Table::named("customers_table", "wh")]);
        assert!(wh.table_exists("customers_table").unwrap());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_going() {
        let (wh, ctx) = setup();
        // a temp table on a connection that does not exist cannot be dropped
        let orphan = Table::temp("gone").materialize();
        ctx.temp_tables.register(&orphan);
        let a = temp(&wh, &ctx);

        let err = Cleanup::all().execute(&ctx).await.unwrap_err();
        match err {
            ToolError::CleanupFailed(failed) => assert_eq!(failed, vec![orphan.to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
        // the other drop still happened
        assert!(!wh.table_exists(a.require_name().unwrap()).unwrap());
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let (_wh, ctx) = setup();
        let out = Cleanup::all().execute(&ctx).await.unwrap();
        assert_eq!(out, StepOutput::Cleanup(CleanupReport::default()));
    }
}
