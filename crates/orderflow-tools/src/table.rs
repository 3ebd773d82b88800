//! Table and file references.
//!
//! A reference carries identity and location only, never data.

use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Prefix given to tables named by the toolkit rather than the user.
pub const TEMP_PREFIX: &str = "_tmp_";

/// Handle to a relational table on a named connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Table {
    /// Table name, `None` until an unnamed table is materialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Connection id the table lives on.
    pub conn_id: String,

    /// Set when the name was generated; such tables are eligible for cleanup.
    #[serde(default)]
    pub temp: bool,
}

impl Table {
    /// A table with an explicit, durable name.
    pub fn named(name: impl Into<String>, conn_id: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            conn_id: conn_id.into(),
            temp: false,
        }
    }

    /// A table whose name is generated when it is first written.
    pub fn temp(conn_id: impl Into<String>) -> Self {
        Self {
            name: None,
            conn_id: conn_id.into(),
            temp: true,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.temp
    }

    /// Return a copy with a concrete name, generating one if needed.
    pub fn materialize(&self) -> Self {
        match &self.name {
            Some(_) => self.clone(),
            None => Self {
                name: Some(generate_temp_name()),
                conn_id: self.conn_id.clone(),
                temp: true,
            },
        }
    }

    /// The table name, failing if the table was never materialized.
    pub fn require_name(&self) -> Result<&str, ToolError> {
        self.name.as_deref().ok_or_else(|| {
            ToolError::Configuration(format!(
                "table on connection '{}' has not been materialized",
                self.conn_id
            ))
        })
    }

    /// Quoted identifier usable inside SQL text.
    pub fn sql_identifier(&self) -> Result<String, ToolError> {
        let name = self.require_name()?;
        validate_identifier(name)?;
        Ok(quote_identifier(name))
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}@{}", name, self.conn_id),
            None => write!(f, "<unnamed>@{}", self.conn_id),
        }
    }
}

/// Handle to a file object on a named storage connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct File {
    /// URI or path of the file (`s3://bucket/key`, `file:///x`, `data/x.csv`).
    pub path: String,

    /// Storage connection id.
    pub conn_id: String,
}

impl File {
    pub fn new(path: impl Into<String>, conn_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            conn_id: conn_id.into(),
        }
    }
}

impl std::fmt::Display for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.path, self.conn_id)
    }
}

fn generate_temp_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", TEMP_PREFIX, &id[..16])
}

/// Check that a (optionally schema-qualified) table name is a plain identifier.
pub fn validate_identifier(name: &str) -> Result<(), ToolError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if !name.is_empty() && name.split('.').all(valid_part) {
        Ok(())
    } else {
        Err(ToolError::Configuration(format!(
            "invalid table name '{}'",
            name
        )))
    }
}

/// Quote each dotted part of an identifier.
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join(".")
}
