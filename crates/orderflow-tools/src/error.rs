//! Step execution error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while running a pipeline step.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Input file missing or unreadable.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Connection id unknown or the backing store could not be opened.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Existing table schema conflicts with the incoming data.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Malformed SQL.
    #[error("Query syntax error: {0}")]
    QuerySyntaxError(String),

    /// Incompatible column types (joins, comparisons, casts).
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Requested column does not exist.
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Merge conflict column absent from source or target.
    #[error("Conflict column missing: {0}")]
    ConflictColumnMissing(String),

    /// Constraint violation on write.
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Query template placeholders and bindings disagree.
    #[error("Unbound placeholder: {0}")]
    UnboundPlaceholder(String),

    /// Table does not exist on its connection.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Template rendering error.
    #[error("Template error: {0}")]
    Template(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Step execution timed out.
    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),

    /// One or more temporary tables could not be dropped.
    #[error("Cleanup failed for {} table(s): {}", .0.len(), .0.join(", "))]
    CleanupFailed(Vec<String>),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
}

/// Stable classification of a [`ToolError`], used in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceUnavailable,
    ConnectionError,
    SchemaMismatch,
    QuerySyntaxError,
    TypeMismatch,
    ColumnNotFound,
    ConflictColumnMissing,
    WriteRejected,
    UnboundPlaceholder,
    TableNotFound,
    Database,
    Template,
    Configuration,
    Timeout,
    CleanupFailed,
    Io,
    Json,
    /// Run cancelled before the step could start.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            ToolError::ConnectionError(_) => ErrorKind::ConnectionError,
            ToolError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            ToolError::QuerySyntaxError(_) => ErrorKind::QuerySyntaxError,
            ToolError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            ToolError::ColumnNotFound(_) => ErrorKind::ColumnNotFound,
            ToolError::ConflictColumnMissing(_) => ErrorKind::ConflictColumnMissing,
            ToolError::WriteRejected(_) => ErrorKind::WriteRejected,
            ToolError::UnboundPlaceholder(_) => ErrorKind::UnboundPlaceholder,
            ToolError::TableNotFound(_) => ErrorKind::TableNotFound,
            ToolError::Database(_) => ErrorKind::Database,
            ToolError::Template(_) => ErrorKind::Template,
            ToolError::Configuration(_) => ErrorKind::Configuration,
            ToolError::Timeout(_) => ErrorKind::Timeout,
            ToolError::CleanupFailed(_) => ErrorKind::CleanupFailed,
            ToolError::Io(_) => ErrorKind::Io,
            ToolError::Json(_) => ErrorKind::Json,
        }
    }

    /// Whether retrying the step could plausibly succeed.
    ///
    /// Definition-level problems (bad SQL, missing columns, schema
    /// conflicts) fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolError::ConnectionError(_)
                | ToolError::SourceUnavailable(_)
                | ToolError::Timeout(_)
                | ToolError::Io(_)
                | ToolError::Database(_)
        )
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Json(e.to_string())
    }
}

impl From<minijinja::Error> for ToolError {
    fn from(e: minijinja::Error) -> Self {
        ToolError::Template(e.to_string())
    }
}

/// Map a DuckDB error onto the step error taxonomy.
///
/// DuckDB reports the error class as a message prefix
/// (`Parser Error:`, `Binder Error:`, `Conversion Error:` ...).
impl From<duckdb::Error> for ToolError {
    fn from(e: duckdb::Error) -> Self {
        classify_database_message(&e.to_string())
    }
}

pub(crate) fn classify_database_message(message: &str) -> ToolError {
    let msg = message.to_string();
    if msg.contains("Parser Error") || msg.contains("syntax error") {
        ToolError::QuerySyntaxError(msg)
    } else if msg.contains("Conversion Error")
        || msg.contains("Cannot compare values of type")
        || msg.contains("No function matches")
        || msg.contains("Mismatch Type Error")
    {
        ToolError::TypeMismatch(msg)
    } else if msg.contains("Constraint Error") {
        ToolError::WriteRejected(msg)
    } else if msg.contains("Catalog Error") && msg.contains("does not exist") {
        ToolError::TableNotFound(msg)
    } else if msg.contains("Connection Error") || msg.contains("IO Error") {
        ToolError::ConnectionError(msg)
    } else {
        ToolError::Database(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ToolError::ColumnNotFound("purchase_date".to_string());
        assert_eq!(err.to_string(), "Column not found: purchase_date");

        let err = ToolError::Timeout(30);
        assert_eq!(err.to_string(), "Execution timed out after 30 seconds");

        let err = ToolError::CleanupFailed(vec!["_tmp_a".to_string(), "_tmp_b".to_string()]);
        assert_eq!(err.to_string(), "Cleanup failed for 2 table(s): _tmp_a, _tmp_b");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let tool_err: ToolError = io_err.into();
        assert!(matches!(tool_err, ToolError::Io(_)));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            ToolError::UnboundPlaceholder("x".into()).kind(),
            ErrorKind::UnboundPlaceholder
        );
        assert_eq!(ErrorKind::WriteRejected.to_string(), "WriteRejected");
    }

    #[test]
    fn test_classify_database_message() {
        assert!(matches!(
            classify_database_message("Parser Error: syntax error at or near \"SELEC\""),
            ToolError::QuerySyntaxError(_)
        ));
        assert!(matches!(
            classify_database_message(
                "Binder Error: Cannot compare values of type INTEGER and type DATE"
            ),
            ToolError::TypeMismatch(_)
        ));
        assert!(matches!(
            classify_database_message("Constraint Error: NOT NULL constraint failed"),
            ToolError::WriteRejected(_)
        ));
        assert!(matches!(
            classify_database_message("Catalog Error: Table with name t does not exist!"),
            ToolError::TableNotFound(_)
        ));
        assert!(matches!(
            classify_database_message("Out of Memory Error"),
            ToolError::Database(_)
        ));
    }

    #[test]
    fn test_transient() {
        assert!(ToolError::ConnectionError("down".into()).is_transient());
        assert!(!ToolError::QuerySyntaxError("bad".into()).is_transient());
    }
}
