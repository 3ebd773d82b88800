//! Error types for pipeline definition and execution.

use orderflow_tools::ToolError;
use thiserror::Error;

/// Engine-level errors.
///
/// Step failures during a run never surface here; they are recorded in the
/// [`RunReport`](crate::RunReport). These are definition and setup errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid pipeline definition
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unparsable schedule expression
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Reference to a node that was never added
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Edge would make the graph cyclic
    #[error("Cycle detected: {0}")]
    Cycle(String),

    /// Operator rejected its own definition
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
