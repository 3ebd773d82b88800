//! Command line interface.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use orderflow_engine::schedule::start_of_day;
use orderflow_engine::{Orchestrator, PipelineGraph, RunReport, Scheduler};
use orderflow_tools::{ConnectionRegistry, DataFrame};

use crate::config::PipelineSettings;
use crate::orders;

#[derive(Parser, Debug)]
#[command(name = "orderflow")]
#[command(version, about = "Daily orders pipeline: load, filter, join, merge, extract", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline once for a logical date
    Run {
        /// Logical date (YYYY-MM-DD), defaults to the most recent schedule tick
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the scheduler until interrupted
    Schedule,

    /// Print the declared step graph
    Graph {
        #[arg(long)]
        json: bool,
    },

    /// Execute one SQL statement on a warehouse connection
    Sql {
        /// Connection id
        #[arg(short, long)]
        conn: String,

        #[arg(value_name = "STATEMENT")]
        statement: String,
    },
}

/// Dispatch a parsed command.
pub async fn execute(cli: Cli, settings: PipelineSettings) -> Result<()> {
    match cli.command {
        Commands::Run { date, json } => {
            let registry = connections(&settings)?;
            let report = run_once(&settings, registry, date).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_report(&report));
            }
            if !report.is_success() {
                bail!("run {} finished with state {}", report.run_id, report.state);
            }
        }
        Commands::Schedule => {
            let registry = connections(&settings)?;
            let declared = orders::build(&settings)?;
            let orchestrator = Orchestrator::new(Arc::new(registry));
            let cancel = orchestrator.cancel_handle();

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received");
                    cancel.cancel();
                }
            });

            let mut scheduler = Scheduler::new(Arc::new(declared.pipeline), orchestrator);
            scheduler.run_forever().await?;
        }
        Commands::Graph { json } => {
            let graph = orders::build(&settings)?.pipeline.graph()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&graph)?);
            } else {
                print!("{}", render_graph(&graph));
            }
        }
        Commands::Sql { conn, statement } => {
            let registry = ConnectionRegistry::from_env()?;
            let warehouse = registry.warehouse(&conn)?;
            let output = warehouse
                .run_blocking(move |wh| {
                    if returns_rows(&statement) {
                        wh.query_frame(&statement).map(|df| render_frame(&df))
                    } else {
                        wh.execute_batch(&statement).map(|_| "OK\n".to_string())
                    }
                })
                .await?;
            print!("{}", output);
        }
    }
    Ok(())
}

/// Connections from the environment; both pipeline connections must exist.
pub fn connections(settings: &PipelineSettings) -> Result<ConnectionRegistry> {
    let registry = ConnectionRegistry::from_env().context("Failed to load connections")?;
    for id in [&settings.storage_conn_id, &settings.warehouse_conn_id] {
        if !registry.has(id) {
            let known = registry.list();
            bail!(
                "connection '{}' is not configured (set ORDERFLOW_CONN_{}); configured: [{}]",
                id,
                id.to_uppercase(),
                known.join(", ")
            );
        }
    }
    Ok(registry)
}

/// Declare the pipeline and run it once.
pub async fn run_once(
    settings: &PipelineSettings,
    registry: ConnectionRegistry,
    date: Option<NaiveDate>,
) -> Result<RunReport> {
    let declared = orders::build(settings)?;
    let pipeline = declared.pipeline;
    let logical_date = match date {
        Some(date) => date,
        None => pipeline
            .schedule
            .latest_tick(start_of_day(pipeline.start_date), Utc::now())
            .map(|tick| tick.date_naive())
            .with_context(|| format!("no schedule tick since {}", pipeline.start_date))?,
    };

    let orchestrator = Orchestrator::new(Arc::new(registry));
    Ok(orchestrator.run(&pipeline, logical_date).await?)
}

fn returns_rows(statement: &str) -> bool {
    let first = statement
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    matches!(
        first.as_str(),
        "select" | "with" | "from" | "describe" | "show" | "pragma" | "summarize" | "values"
    )
}

pub fn render_report(report: &RunReport) -> String {
    let mut out = format!(
        "run {} ({} {}): {}\n",
        report.run_id, report.pipeline_id, report.logical_date, report.state
    );
    for step in &report.steps {
        out.push_str(&format!("  {:<24} {:<16}", step.name, step.state.to_string()));
        if let Some(ms) = step.duration_ms {
            out.push_str(&format!(" {}ms", ms));
        }
        if let Some(err) = &step.error {
            out.push_str(&format!(" {}", err));
        }
        out.push('\n');
        if let Some(output) = report.output(&step.name) {
            out.push_str(&format!("    -> {}\n", output.summary()));
        }
    }
    if let Some(failure) = &report.failure {
        out.push_str(&format!(
            "failed at {} ({}): {}\n",
            failure.step, failure.kind, failure.message
        ));
    }
    out
}

pub fn render_graph(graph: &PipelineGraph) -> String {
    let mut out = format!(
        "{} schedule={} start_date={} catchup={}\n",
        graph.id, graph.schedule, graph.start_date, graph.catchup
    );
    for node in &graph.nodes {
        out.push_str(&format!("  {} [{}, {}]", node.id, node.kind, node.trigger_rule));
        if !node.upstream.is_empty() {
            out.push_str(&format!(" <- {}", node.upstream.join(", ")));
        }
        out.push('\n');
    }
    out
}

pub fn render_frame(df: &DataFrame) -> String {
    let mut out = df.columns.join("\t");
    out.push('\n');
    for row in &df.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => "NULL".to_string(),
                other => other.to_string(),
            })
            .collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out.push_str(&format!("({} rows)\n", df.row_count()));
    out
}
