//! orderflow pipeline engine
//!
//! - **Pipeline**: explicit DAG builder returning handles for each step
//! - **Schedule**: presets and cron expressions, catchup selection
//! - **State**: run and step state machines, run reports
//! - **Orchestrator**: executes a run in dependency waves
//! - **Scheduler**: runs due ticks one at a time

pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod schedule;
pub mod scheduler;
pub mod state;

pub use error::{EngineError, EngineResult};
pub use orchestrator::{CancelHandle, Orchestrator};
pub use pipeline::{DataHandle, NodeRef, Pipeline, PipelineGraph, TableHandle, TriggerRule};
pub use schedule::Schedule;
pub use scheduler::Scheduler;
pub use state::{FailureSummary, RunReport, RunState, StepInfo, StepState};
