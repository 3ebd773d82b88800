//! Dataframe transform: run a routine over a materialized table.

use async_trait::async_trait;
use std::sync::Arc;

use crate::context::{RunContext, TableSource};
use crate::error::ToolError;
use crate::frame::DataFrame;
use crate::registry::Operator;
use crate::result::StepOutput;

/// User routine applied to the materialized input.
pub type FrameRoutine = Arc<dyn Fn(&DataFrame) -> Result<StepOutput, ToolError> + Send + Sync>;

/// Dataframe transform step.
#[derive(Clone)]
pub struct DataframeTransform {
    /// Step name (used as the node id).
    pub name: String,

    /// Table (or upstream frame) to materialize.
    pub input: TableSource,

    routine: FrameRoutine,
}

impl std::fmt::Debug for DataframeTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataframeTransform")
            .field("name", &self.name)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

impl DataframeTransform {
    pub fn new<F>(name: impl Into<String>, input: impl Into<TableSource>, routine: F) -> Self
    where
        F: Fn(&DataFrame) -> Result<StepOutput, ToolError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input: input.into(),
            routine: Arc::new(routine),
        }
    }

    /// A transform returning one column of its input.
    pub fn select_column(
        name: impl Into<String>,
        input: impl Into<TableSource>,
        column: impl Into<String>,
    ) -> Self {
        let column = column.into();
        Self::new(name, input, move |df| Ok(StepOutput::Column(df.column(&column)?)))
    }

    /// Materialize the input: upstream frames pass through, tables are read.
    async fn load_frame(&self, ctx: &RunContext) -> Result<DataFrame, ToolError> {
        if let TableSource::Upstream(node) = &self.input {
            if let StepOutput::Frame(frame) = ctx.input(node)? {
                return Ok(frame.clone());
            }
        }

        let table = ctx.resolve_table(&self.input)?;
        let name = table.require_name()?.to_string();
        let warehouse = ctx.connections.warehouse(&table.conn_id)?;
        warehouse.run_blocking(move |wh| wh.read_table(&name)).await
    }
}

#[async_trait]
impl Operator for DataframeTransform {
    fn kind(&self) -> &'static str {
        "dataframe"
    }

    fn inputs(&self) -> Vec<TableSource> {
        vec![self.input.clone()]
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StepOutput, ToolError> {
        let frame = self.load_frame(ctx).await?;
        tracing::debug!(
            step = %ctx.step,
            rows = frame.row_count(),
            columns = frame.columns.len(),
            "Frame materialized"
        );
        (self.routine)(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::table::Table;
    use crate::warehouse::Warehouse;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx() -> RunContext {
        let wh = Warehouse::in_memory().unwrap();
        wh.execute_batch(
            "CREATE TABLE reporting_table (order_id INTEGER, purchase_date DATE);
             INSERT INTO reporting_table VALUES (2, '2022-01-02'), (1, '2022-01-01');",
        )
        .unwrap();
        let mut registry = ConnectionRegistry::new();
        registry.register_warehouse("wh", wh);
        RunContext::new(
            "run-1",
            "test",
            NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            Arc::new(registry),
        )
    }

    #[tokio::test]
    async fn test_select_column_keeps_row_order() {
        let op = DataframeTransform::select_column(
            "transform_dataframe",
            Table::named("reporting_table", "wh"),
            "purchase_date",
        );
        let out = op.execute(&ctx()).await.unwrap();
        let column = out.as_column().unwrap();
        assert_eq!(column.values, vec![json!("2022-01-02"), json!("2022-01-01")]);
    }

    #[tokio::test]
    async fn test_missing_column_fails() {
        let op = DataframeTransform::select_column(
            "transform_dataframe",
            Table::named("reporting_table", "wh"),
            "amount",
        );
        let err = op.execute(&ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::ColumnNotFound(_)));
    }

    #[tokio::test]
    async fn test_upstream_frame_passes_through() {
        let frame = DataFrame::new(vec!["x".into()], vec![vec![json!(1)], vec![json!(2)]]);
        let mut inputs = HashMap::new();
        inputs.insert("make_frame".to_string(), StepOutput::Frame(frame.clone()));
        let ctx = ctx().for_step("count", inputs);

        let op = DataframeTransform::new(
            "count",
            TableSource::Upstream("make_frame".into()),
            |df| Ok(StepOutput::Frame(DataFrame::new(
                vec!["n".into()],
                vec![vec![json!(df.row_count())]],
            ))),
        );
        let out = op.execute(&ctx).await.unwrap();
        assert_eq!(out.as_frame().unwrap().rows[0][0], json!(2));
    }

    #[tokio::test]
    async fn test_missing_table() {
        let op = DataframeTransform::select_column("x", Table::named("nope", "wh"), "a");
        let err = op.execute(&ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::TableNotFound(_)));
    }
}
