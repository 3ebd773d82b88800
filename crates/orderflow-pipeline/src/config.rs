//! Pipeline configuration.

use chrono::NaiveDate;
use orderflow_tools::table::validate_identifier;
use orderflow_tools::{RetryConfig, StepConfig, ToolError};
use serde::Deserialize;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Settings for the orders pipeline, loaded from environment variables.
///
/// Environment variables are prefixed with `ORDERFLOW_`:
/// - `ORDERFLOW_PIPELINE_ID`: Pipeline id (default: "astro_orders")
/// - `ORDERFLOW_START_DATE`: First logical date (default: "2022-01-01")
/// - `ORDERFLOW_SCHEDULE`: Preset or cron expression (default: "@daily")
/// - `ORDERFLOW_CATCHUP`: Backfill missed ticks (default: false)
/// - `ORDERFLOW_STORAGE_PATH`: Object storage prefix of the orders file
/// - `ORDERFLOW_STORAGE_CONN_ID` / `ORDERFLOW_WAREHOUSE_CONN_ID`: Connection ids
///
/// Connection ids resolve through `ORDERFLOW_CONN_<ID>` URIs.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_pipeline_id")]
    pub pipeline_id: String,

    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,

    #[serde(default = "default_schedule")]
    pub schedule: String,

    #[serde(default)]
    pub catchup: bool,

    /// Prefix the orders file lives under
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    #[serde(default = "default_orders_file")]
    pub orders_file: String,

    #[serde(default = "default_storage_conn_id")]
    pub storage_conn_id: String,

    #[serde(default = "default_warehouse_conn_id")]
    pub warehouse_conn_id: String,

    #[serde(default = "default_customers_table")]
    pub customers_table: String,

    #[serde(default = "default_reporting_table")]
    pub reporting_table: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Retries per step (transient errors only)
    #[serde(default)]
    pub step_retries: u32,

    /// Per-step timeout in seconds
    #[serde(default)]
    pub step_timeout: Option<u64>,
}

fn default_pipeline_id() -> String {
    "astro_orders".to_string()
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or_default()
}

fn default_schedule() -> String {
    "@daily".to_string()
}

fn default_storage_path() -> String {
    "s3://mutahar-astrosdk".to_string()
}

fn default_orders_file() -> String {
    "orders_data_header.csv".to_string()
}

fn default_storage_conn_id() -> String {
    "aws_default".to_string()
}

fn default_warehouse_conn_id() -> String {
    "snowflake_default".to_string()
}

fn default_customers_table() -> String {
    "customers_table".to_string()
}

fn default_reporting_table() -> String {
    "reporting_table".to_string()
}

impl PipelineSettings {
    /// Load settings from environment variables prefixed with `ORDERFLOW_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ORDERFLOW_").from_env::<PipelineSettings>()
    }

    /// Load settings from an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed("ORDERFLOW_").from_iter(vars)
    }

    /// Full URI of the orders file.
    pub fn orders_uri(&self) -> String {
        format!("{}/{}", self.storage_path.trim_end_matches('/'), self.orders_file)
    }

    pub fn validate(&self) -> Result<(), ToolError> {
        validate_identifier(&self.customers_table)?;
        validate_identifier(&self.reporting_table)?;
        for (what, id) in [
            ("storage", &self.storage_conn_id),
            ("warehouse", &self.warehouse_conn_id),
        ] {
            if id.trim().is_empty() {
                return Err(ToolError::Configuration(format!("{} connection id is empty", what)));
            }
        }
        Ok(())
    }

    /// Step settings applied to every step.
    pub fn step_config(&self) -> StepConfig {
        StepConfig {
            timeout: self.step_timeout,
            retry: (self.step_retries > 0).then(|| RetryConfig::with_retries(self.step_retries)),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pipeline_id: default_pipeline_id(),
            start_date: default_start_date(),
            schedule: default_schedule(),
            catchup: false,
            storage_path: default_storage_path(),
            orders_file: default_orders_file(),
            storage_conn_id: default_storage_conn_id(),
            warehouse_conn_id: default_warehouse_conn_id(),
            customers_table: default_customers_table(),
            reporting_table: default_reporting_table(),
            log_format: LogFormat::Text,
            step_retries: 0,
            step_timeout: None,
        }
    }
}
