//! Step execution result types.

use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::frame::{Column, DataFrame};
use crate::table::Table;

/// Outcome of a cleanup step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Tables that were dropped.
    pub dropped: Vec<Table>,
    /// Tables whose drop failed, with the error text.
    pub failed: Vec<(Table, String)>,
    /// Named tables that were asked for but left in place.
    pub skipped: Vec<Table>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Value produced by a step and handed to its downstream steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutput {
    /// A materialized table.
    Table(Table),
    /// A materialized frame.
    Frame(DataFrame),
    /// A single derived column.
    Column(Column),
    /// Result of dropping temporary tables.
    Cleanup(CleanupReport),
}

impl StepOutput {
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            StepOutput::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_frame(&self) -> Option<&DataFrame> {
        match self {
            StepOutput::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_column(&self) -> Option<&Column> {
        match self {
            StepOutput::Column(c) => Some(c),
            _ => None,
        }
    }

    /// Short human description for logs.
    pub fn summary(&self) -> String {
        match self {
            StepOutput::Table(t) => format!("table {}", t),
            StepOutput::Frame(f) => format!("frame {}x{}", f.row_count(), f.columns.len()),
            StepOutput::Column(c) => format!("column {} ({} values)", c.name, c.len()),
            StepOutput::Cleanup(r) => format!(
                "cleanup dropped={} failed={}",
                r.dropped.len(),
                r.failed.len()
            ),
        }
    }

    /// Unwrap a table output or explain what arrived instead.
    pub fn into_table(self, step: &str) -> Result<Table, ToolError> {
        match self {
            StepOutput::Table(t) => Ok(t),
            other => Err(ToolError::Configuration(format!(
                "step '{}' produced {} where a table was expected",
                step,
                other.summary()
            ))),
        }
    }
}
