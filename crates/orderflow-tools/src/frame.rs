//! In-memory tabular data handed to dataframe routines.

use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Rows by named columns, in table order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// A single named column of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<serde_json::Value>,
}

impl DataFrame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, matched case-insensitively like SQL identifiers.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
    }

    /// Select one column; row order is preserved.
    pub fn column(&self, name: &str) -> Result<Column, ToolError> {
        let idx = self.column_index(name).ok_or_else(|| {
            ToolError::ColumnNotFound(format!(
                "'{}' (available: {})",
                name,
                self.columns.join(", ")
            ))
        })?;

        let values = self
            .rows
            .iter()
            .map(|row| row.get(idx).cloned().unwrap_or(serde_json::Value::Null))
            .collect();

        Ok(Column {
            name: self.columns[idx].clone(),
            values,
        })
    }
}

impl Column {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.name)?;
        for (i, value) in self.values.iter().enumerate() {
            match value {
                serde_json::Value::String(s) => writeln!(f, "{:<4} {}", i, s)?,
                other => writeln!(f, "{:<4} {}", i, other)?,
            }
        }
        write!(f, "Length: {}", self.values.len())
    }
}
