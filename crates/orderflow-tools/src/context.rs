//! Run context for step execution.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionRegistry;
use crate::error::ToolError;
use crate::result::StepOutput;
use crate::table::Table;

/// Where a step reads a table from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableSource {
    /// A table known at definition time.
    Table(Table),
    /// The table produced by an upstream node.
    Upstream(String),
}

impl TableSource {
    pub fn upstream_node(&self) -> Option<&str> {
        match self {
            TableSource::Upstream(id) => Some(id),
            TableSource::Table(_) => None,
        }
    }
}

impl From<Table> for TableSource {
    fn from(table: Table) -> Self {
        TableSource::Table(table)
    }
}

/// Temporary tables created during one run.
#[derive(Debug, Clone, Default)]
pub struct TempTables {
    inner: Arc<Mutex<Vec<Table>>>,
}

impl TempTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a table for cleanup. Named tables are ignored.
    pub fn register(&self, table: &Table) {
        if !table.is_temporary() {
            return;
        }
        if let Ok(mut tables) = self.inner.lock() {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }
    }

    /// Current set, in creation order.
    pub fn snapshot(&self) -> Vec<Table> {
        self.inner.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn forget(&self, table: &Table) {
        if let Ok(mut tables) = self.inner.lock() {
            tables.retain(|t| t != table);
        }
    }
}

/// Everything a step needs while it runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique run id.
    pub run_id: String,

    /// Pipeline id.
    pub pipeline_id: String,

    /// Logical date of the run (schedule tick).
    pub logical_date: NaiveDate,

    /// Current step name.
    pub step: String,

    /// Outputs of upstream steps, by node id.
    pub inputs: HashMap<String, StepOutput>,

    /// Connections available to the run.
    pub connections: Arc<ConnectionRegistry>,

    /// Temporary tables created by this run.
    pub temp_tables: TempTables,
}

impl RunContext {
    /// Create a new run context.
    pub fn new(
        run_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        logical_date: NaiveDate,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_id: pipeline_id.into(),
            logical_date,
            step: String::new(),
            inputs: HashMap::new(),
            connections,
            temp_tables: TempTables::new(),
        }
    }

    /// Context for a single step, carrying its upstream outputs.
    pub fn for_step(&self, step: impl Into<String>, inputs: HashMap<String, StepOutput>) -> Self {
        Self {
            step: step.into(),
            inputs,
            ..self.clone()
        }
    }

    pub fn input(&self, node: &str) -> Result<&StepOutput, ToolError> {
        self.inputs.get(node).ok_or_else(|| {
            ToolError::Configuration(format!(
                "step '{}' has no output from upstream '{}'",
                self.step, node
            ))
        })
    }

    /// Resolve a table source to a concrete table.
    pub fn resolve_table(&self, source: &TableSource) -> Result<Table, ToolError> {
        match source {
            TableSource::Table(table) => Ok(table.clone()),
            TableSource::Upstream(node) => self.input(node)?.clone().into_table(node),
        }
    }

    /// Built-in values available to SQL templates without binding.
    pub fn template_variables(&self) -> HashMap<String, serde_json::Value> {
        let mut vars = HashMap::new();
        vars.insert("run_id".to_string(), serde_json::json!(self.run_id));
        vars.insert("pipeline_id".to_string(), serde_json::json!(self.pipeline_id));
        vars.insert(
            "ds".to_string(),
            serde_json::json!(self.logical_date.format("%Y-%m-%d").to_string()),
        );
        vars.insert(
            "ds_nodash".to_string(),
            serde_json::json!(self.logical_date.format("%Y%m%d").to_string()),
        );
        vars
    }
}

/// Names of the variables [`RunContext::template_variables`] provides.
pub const BUILTIN_TEMPLATE_VARIABLES: &[&str] = &["run_id", "pipeline_id", "ds", "ds_nodash"];

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext::new(
            "run-1",
            "astro_orders",
            NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            Arc::new(ConnectionRegistry::new()),
        )
    }

    #[test]
    fn test_resolve_table() {
        let mut inputs = HashMap::new();
        inputs.insert(
            "load_file".to_string(),
            StepOutput::Table(Table::named("_tmp_1", "wh")),
        );
        let step = ctx().for_step("filter_orders", inputs);

        let table = step
            .resolve_table(&TableSource::Upstream("load_file".into()))
            .unwrap();
        assert_eq!(table.name.as_deref(), Some("_tmp_1"));

        let named = Table::named("customers_table", "wh");
        assert_eq!(step.resolve_table(&named.clone().into()).unwrap(), named);

        assert!(step
            .resolve_table(&TableSource::Upstream("missing".into()))
            .is_err());
    }

    #[test]
    fn test_temp_tables_ignore_named() {
        let ctx = ctx();
        ctx.temp_tables.register(&Table::named("reporting_table", "wh"));
        let temp = Table::temp("wh").materialize();
        ctx.temp_tables.register(&temp);
        ctx.temp_tables.register(&temp);

        // shared across step contexts of the same run
        let step = ctx.for_step("x", HashMap::new());
        assert_eq!(step.temp_tables.snapshot(), vec![temp.clone()]);

        step.temp_tables.forget(&temp);
        assert!(ctx.temp_tables.snapshot().is_empty());
    }

    #[test]
    fn test_template_variables() {
        let vars = ctx().template_variables();
        assert_eq!(vars["ds"], serde_json::json!("2022-01-01"));
        assert_eq!(vars["ds_nodash"], serde_json::json!("20220101"));
        for name in BUILTIN_TEMPLATE_VARIABLES {
            assert!(vars.contains_key(*name));
        }
    }
}
