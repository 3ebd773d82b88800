//! orderflow binary.
//!
//! Runs, schedules or inspects the orders pipeline.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orderflow_pipeline::cli::{self, Cli};
use orderflow_pipeline::{LogFormat, PipelineSettings};

const DEFAULT_LOG_FILTER: &str = "info,orderflow_engine=debug,orderflow_tools=debug";

/// Initialize tracing/logging.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    // stdout is reserved for command output
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Json => registry.with(layer.json()).init(),
        LogFormat::Text => registry.with(layer).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = PipelineSettings::from_env()?;
    init_tracing(settings.log_format);

    tracing::info!(
        pipeline = %settings.pipeline_id,
        schedule = %settings.schedule,
        storage_conn = %settings.storage_conn_id,
        warehouse_conn = %settings.warehouse_conn_id,
        "Configuration loaded"
    );

    if let Err(e) = cli::execute(cli, settings).await {
        tracing::error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
