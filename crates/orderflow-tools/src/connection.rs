//! Named connections.
//!
//! Steps refer to warehouses and storage by connection id only. The registry
//! maps those ids onto live backends, built from connection URIs:
//!
//! - `duckdb://:memory:` (or `duckdb://`): in-memory warehouse
//! - `duckdb:///abs/path.duckdb`: file-backed warehouse
//! - `file:///abs/root`: local object storage rooted at a directory

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ToolError;
use crate::storage::{LocalStorage, ObjectStorage};
use crate::warehouse::{Warehouse, WarehouseTarget};

/// Environment prefix for connection URIs (`ORDERFLOW_CONN_SNOWFLAKE_DEFAULT`).
pub const CONN_ENV_PREFIX: &str = "ORDERFLOW_CONN_";

/// A parsed connection URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    Warehouse(WarehouseTarget),
    LocalStorage(PathBuf),
}

impl ConnectionSpec {
    pub fn parse(uri: &str) -> Result<Self, ToolError> {
        let uri = uri.trim();
        if let Some(rest) = uri.strip_prefix("duckdb://") {
            return match rest {
                "" | ":memory:" | "/:memory:" => Ok(Self::Warehouse(WarehouseTarget::InMemory)),
                path if path.starts_with('/') => {
                    Ok(Self::Warehouse(WarehouseTarget::File(PathBuf::from(path))))
                }
                other => Err(ToolError::ConnectionError(format!(
                    "duckdb connection needs an absolute path or :memory:, got '{}'",
                    other
                ))),
            };
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            if rest.starts_with('/') {
                return Ok(Self::LocalStorage(PathBuf::from(rest)));
            }
            return Err(ToolError::ConnectionError(format!(
                "file connection needs an absolute root, got '{}'",
                rest
            )));
        }
        Err(ToolError::ConnectionError(format!(
            "unsupported connection uri '{}'",
            uri
        )))
    }
}

/// A live connection.
#[derive(Debug, Clone)]
pub enum Connection {
    Warehouse(Warehouse),
    Storage(Arc<dyn ObjectStorage>),
}

/// Registry of connections by id.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, Connection>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Build from `ORDERFLOW_CONN_<ID>` environment variables.
    ///
    /// Ids are lower-cased: `ORDERFLOW_CONN_AWS_DEFAULT` registers `aws_default`.
    pub fn from_env() -> Result<Self, ToolError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ToolError> {
        let mut registry = Self::new();
        for (key, value) in vars {
            if let Some(id) = key.strip_prefix(CONN_ENV_PREFIX) {
                let id = id.to_lowercase();
                registry.register_uri(&id, &value)?;
            }
        }
        Ok(registry)
    }

    /// Parse a URI and open the connection it names.
    pub fn register_uri(&mut self, id: &str, uri: &str) -> Result<(), ToolError> {
        let spec = ConnectionSpec::parse(uri)
            .map_err(|e| ToolError::ConnectionError(format!("connection '{}': {}", id, e)))?;
        let connection = match spec {
            ConnectionSpec::Warehouse(target) => Connection::Warehouse(Warehouse::from_target(&target)?),
            ConnectionSpec::LocalStorage(root) => {
                Connection::Storage(Arc::new(LocalStorage::new(root)))
            }
        };
        tracing::debug!(conn_id = %id, uri = %uri, "Registered connection");
        self.connections.insert(id.to_string(), connection);
        Ok(())
    }

    pub fn register_warehouse(&mut self, id: impl Into<String>, warehouse: Warehouse) {
        self.connections
            .insert(id.into(), Connection::Warehouse(warehouse));
    }

    pub fn register_storage<S: ObjectStorage + 'static>(&mut self, id: impl Into<String>, storage: S) {
        self.connections
            .insert(id.into(), Connection::Storage(Arc::new(storage)));
    }

    /// Check if a connection is registered.
    pub fn has(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// List all registered connection ids.
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.connections.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn warehouse(&self, id: &str) -> Result<Warehouse, ToolError> {
        match self.connections.get(id) {
            Some(Connection::Warehouse(wh)) => Ok(wh.clone()),
            Some(Connection::Storage(_)) => Err(ToolError::ConnectionError(format!(
                "connection '{}' is a storage connection, not a warehouse",
                id
            ))),
            None => Err(ToolError::ConnectionError(format!(
                "unknown connection '{}'",
                id
            ))),
        }
    }

    pub fn storage(&self, id: &str) -> Result<Arc<dyn ObjectStorage>, ToolError> {
        match self.connections.get(id) {
            Some(Connection::Storage(storage)) => Ok(storage.clone()),
            Some(Connection::Warehouse(_)) => Err(ToolError::ConnectionError(format!(
                "connection '{}' is a warehouse, not storage",
                id
            ))),
            None => Err(ToolError::ConnectionError(format!(
                "unknown connection '{}'",
                id
            ))),
        }
    }
}
