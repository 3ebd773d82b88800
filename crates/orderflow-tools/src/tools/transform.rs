//! SQL transform: run a query template over bound tables into a new table.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::context::{RunContext, TableSource};
use crate::error::ToolError;
use crate::registry::Operator;
use crate::result::StepOutput;
use crate::table::Table;
use crate::template::TemplateEngine;

/// SQL transform step.
#[derive(Debug, Clone)]
pub struct SqlTransform {
    /// Step name (used as the node id).
    pub name: String,

    /// Query template with `{{ placeholder }}` table references.
    pub sql: String,

    /// Placeholder bindings in declaration order; the first decides the connection.
    pub bindings: Vec<(String, TableSource)>,

    /// Explicit output table; a temporary table when `None`.
    pub output_table: Option<Table>,
}

impl SqlTransform {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            bindings: Vec::new(),
            output_table: None,
        }
    }

    /// Bind a placeholder to a table.
    pub fn bind(mut self, placeholder: impl Into<String>, table: impl Into<TableSource>) -> Self {
        self.bindings.push((placeholder.into(), table.into()));
        self
    }

    pub fn output_table(mut self, table: Table) -> Self {
        self.output_table = Some(table);
        self
    }

    /// Resolve bindings and check they all live on one connection.
    fn resolve_inputs(&self, ctx: &RunContext) -> Result<(String, Vec<(String, Table)>), ToolError> {
        let mut resolved = Vec::with_capacity(self.bindings.len());
        for (placeholder, source) in &self.bindings {
            resolved.push((placeholder.clone(), ctx.resolve_table(source)?));
        }

        let conn_id = resolved
            .first()
            .map(|(_, t)| t.conn_id.clone())
            .ok_or_else(|| {
                ToolError::Configuration(format!("transform '{}' has no input tables", self.name))
            })?;

        if let Some((placeholder, table)) = resolved.iter().find(|(_, t)| t.conn_id != conn_id) {
            return Err(ToolError::ConnectionError(format!(
                "transform '{}': input '{}' ({}) is not on connection '{}'",
                self.name, placeholder, table, conn_id
            )));
        }
        Ok((conn_id, resolved))
    }
}

#[async_trait]
impl Operator for SqlTransform {
    fn kind(&self) -> &'static str {
        "transform"
    }

    fn inputs(&self) -> Vec<TableSource> {
        self.bindings.iter().map(|(_, s)| s.clone()).collect()
    }

    fn validate(&self) -> Result<(), ToolError> {
        if self.bindings.is_empty() {
            return Err(ToolError::Configuration(format!(
                "transform '{}' needs at least one input table",
                self.name
            )));
        }
        TemplateEngine::check_bindings(&self.sql, self.bindings.iter().map(|(p, _)| p.as_str()))
            .map_err(|e| match e {
                ToolError::UnboundPlaceholder(msg) => {
                    ToolError::UnboundPlaceholder(format!("transform '{}': {}", self.name, msg))
                }
                other => other,
            })
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StepOutput, ToolError> {
        self.validate()?;
        let (conn_id, inputs) = self.resolve_inputs(ctx)?;

        let mut bindings = HashMap::new();
        for (placeholder, table) in &inputs {
            bindings.insert(placeholder.clone(), serde_json::json!(table.sql_identifier()?));
        }
        let query = TemplateEngine::new().render_with_context(&self.sql, ctx, &bindings)?;
        let query = query.trim().trim_end_matches(';').to_string();

        let output = self
            .output_table
            .clone()
            .unwrap_or_else(|| Table::temp(conn_id.clone()))
            .materialize();
        if output.conn_id != conn_id {
            return Err(ToolError::ConnectionError(format!(
                "transform '{}': output {} is not on input connection '{}'",
                self.name, output, conn_id
            )));
        }
        let ident = output.sql_identifier()?;
        let name = output.require_name()?.to_string();

        let warehouse = ctx.connections.warehouse(&conn_id)?;
        ctx.temp_tables.register(&output);

        tracing::debug!(step = %ctx.step, query = %query, output = %output, "Running transform");

        let rows = warehouse
            .run_blocking(move |wh| {
                wh.execute_batch(&format!("CREATE OR REPLACE TABLE {} AS {}", ident, query))?;
                wh.row_count(&name)
            })
            .await?;

        tracing::info!(step = %ctx.step, output = %output, rows, "Transform materialized");
        Ok(StepOutput::Table(output))
    }
}
