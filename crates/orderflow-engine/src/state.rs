//! Run and step state machines.

use chrono::{DateTime, NaiveDate, Utc};
use orderflow_tools::{ErrorKind, StepOutput, ToolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Pipeline declared, no run requested.
    Defined,
    /// Run requested for a schedule tick.
    Scheduled,
    /// Steps are executing.
    Running,
    /// Every step succeeded.
    Succeeded,
    /// A step failed, was upstream-failed, or the run was cancelled midway.
    Failed,
    /// Cancelled before any step ran.
    Skipped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defined => write!(f, "defined"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// State of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Step has not started yet.
    Pending,
    /// Step is executing.
    Running,
    /// Step completed successfully.
    Success,
    /// Step failed.
    Failed,
    /// A required upstream step did not succeed.
    UpstreamFailed,
    /// Step was not started because the run was cancelled.
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::UpstreamFailed => write!(f, "upstream_failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Step information including state and error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub name: String,
    pub kind: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepInfo {
    /// Create a new step info in pending state.
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            state: StepState::Pending,
            error_kind: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn start(&mut self) {
        self.state = StepState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self) {
        self.finish(StepState::Success);
    }

    pub fn fail(&mut self, error: &ToolError) {
        self.error_kind = Some(error.kind());
        self.error = Some(error.to_string());
        self.finish(StepState::Failed);
    }

    pub fn upstream_failed(&mut self, upstream: &str) {
        self.state = StepState::UpstreamFailed;
        self.error = Some(format!("upstream step '{}' did not succeed", upstream));
    }

    pub fn skip(&mut self) {
        self.state = StepState::Skipped;
    }

    fn finish(&mut self, state: StepState) {
        let now = Utc::now();
        self.state = state;
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

/// The step that caused a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub step: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline_id: String,
    pub logical_date: NaiveDate,
    pub state: RunState,
    /// Steps in topological order.
    pub steps: Vec<StepInfo>,
    pub outputs: BTreeMap<String, StepOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn step(&self, name: &str) -> Option<&StepInfo> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&StepOutput> {
        self.outputs.get(name)
    }

    /// Final state from the step states.
    ///
    /// Any failed or upstream-failed step fails the run. The failure summary
    /// points at the first step (in topological order) that failed itself,
    /// or at the first step skipped by a cancellation midway.
    pub(crate) fn conclude(steps: &[StepInfo], cancelled: bool) -> (RunState, Option<FailureSummary>) {
        let mut failure = steps
            .iter()
            .find(|s| s.state == StepState::Failed)
            .map(|s| FailureSummary {
                step: s.name.clone(),
                kind: s.error_kind.unwrap_or(ErrorKind::Database),
                message: s.error.clone().unwrap_or_default(),
            });

        let any_failed = steps
            .iter()
            .any(|s| matches!(s.state, StepState::Failed | StepState::UpstreamFailed));
        let any_ran = steps.iter().any(|s| s.attempts > 0);

        let state = if any_failed {
            RunState::Failed
        } else if cancelled && !any_ran {
            RunState::Skipped
        } else if cancelled {
            RunState::Failed
        } else {
            RunState::Succeeded
        };

        if failure.is_none() && cancelled && state == RunState::Failed {
            failure = steps
                .iter()
                .find(|s| s.state == StepState::Skipped)
                .map(|s| FailureSummary {
                    step: s.name.clone(),
                    kind: ErrorKind::Cancelled,
                    message: "run cancelled before step started".to_string(),
                });
        }
        (state, failure)
    }
}
