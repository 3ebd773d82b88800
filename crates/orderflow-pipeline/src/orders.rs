//! The `astro_orders` pipeline.
//!
//! load_file -> filter_orders -> join_orders_customers -> merge
//! -> transform_dataframe -> cleanup

use orderflow_engine::{DataHandle, EngineResult, Pipeline, TableHandle};
use orderflow_tools::tools::{
    Cleanup, ConflictPolicy, DataframeTransform, LoadFile, Merge, MergeMode, SqlTransform,
};
use orderflow_tools::{DataFrame, File, StepOutput, Table, ToolError};

use crate::config::PipelineSettings;

pub const FILTER_ORDERS_SQL: &str = "SELECT * FROM {{input_table}} WHERE amount > 150";

pub const JOIN_ORDERS_CUSTOMERS_SQL: &str = "SELECT c.customer_id, customer_name, order_id, purchase_date, amount, type
    FROM {{filtered_orders_table}} f JOIN {{customers_table}} c
    ON f.customer_id = c.customer_id";

pub const EXTRACTED_COLUMN: &str = "purchase_date";

/// The declared pipeline plus a handle to every step.
#[derive(Debug)]
pub struct OrdersPipeline {
    pub pipeline: Pipeline,
    pub orders_data: TableHandle,
    pub filtered_orders: TableHandle,
    pub joined_data: TableHandle,
    pub reporting_table: TableHandle,
    pub purchase_dates: DataHandle,
    pub cleanup: DataHandle,
}

/// Keep orders above the amount threshold.
pub fn filter_orders(input_table: &TableHandle) -> SqlTransform {
    SqlTransform::new("filter_orders", FILTER_ORDERS_SQL).bind("input_table", input_table)
}

/// Attach customer names to the filtered orders.
pub fn join_orders_customers(filtered_orders_table: &TableHandle, customers_table: Table) -> SqlTransform {
    SqlTransform::new("join_orders_customers", JOIN_ORDERS_CUSTOMERS_SQL)
        .bind("filtered_orders_table", filtered_orders_table)
        .bind("customers_table", customers_table)
}

/// Pull the purchase dates out of the reporting table and log them.
pub fn transform_dataframe(df: &DataFrame) -> Result<StepOutput, ToolError> {
    let purchase_dates = df.column(EXTRACTED_COLUMN)?;
    tracing::info!(rows = purchase_dates.len(), "purchase_dates:\n{}", purchase_dates);
    Ok(StepOutput::Column(purchase_dates))
}

/// Declare the pipeline from settings.
pub fn build(settings: &PipelineSettings) -> EngineResult<OrdersPipeline> {
    settings.validate()?;

    let mut builder = Pipeline::builder(&settings.pipeline_id)
        .start_date(settings.start_date)
        .schedule(&settings.schedule)
        .catchup(settings.catchup);
    let defaults = settings.step_config();
    if let Some(retry) = defaults.retry {
        builder = builder.default_retry(retry);
    }
    if let Some(timeout) = defaults.timeout {
        builder = builder.default_timeout(timeout);
    }
    let mut pipeline = builder.build()?;

    let warehouse = settings.warehouse_conn_id.as_str();

    let orders_data = pipeline.load_file(LoadFile::new(
        File::new(settings.orders_uri(), &settings.storage_conn_id),
        Table::temp(warehouse),
    ))?;

    let customers_table = Table::named(&settings.customers_table, warehouse);

    let filtered_orders = pipeline.transform(filter_orders(&orders_data))?;
    let joined_data = pipeline.transform(join_orders_customers(&filtered_orders, customers_table))?;

    let reporting_table = pipeline.merge(Merge::new(
        Table::named(&settings.reporting_table, warehouse),
        &joined_data,
        ConflictPolicy::new(["order_id"], ["customer_id", "customer_name"], MergeMode::Update),
    ))?;

    let purchase_dates = pipeline.dataframe(DataframeTransform::new(
        "transform_dataframe",
        &reporting_table,
        transform_dataframe,
    ))?;

    let cleanup = pipeline.cleanup(Cleanup::all())?;
    pipeline.set_downstream(&purchase_dates, &cleanup)?;

    Ok(OrdersPipeline {
        pipeline,
        orders_data,
        filtered_orders,
        joined_data,
        reporting_table,
        purchase_dates,
        cleanup,
    })
}
