//! Object storage connections.
//!
//! Paths are URIs as written in pipeline definitions (`s3://bucket/key`).
//! The local backend maps the bucket and key onto a directory root, which is
//! what the pipeline uses outside of a cloud deployment.

use std::path::{Component, Path, PathBuf};

use crate::error::ToolError;

/// Read access to files named by URI.
pub trait ObjectStorage: Send + Sync + std::fmt::Debug {
    /// Storage backend name, for logs.
    fn kind(&self) -> &'static str;

    /// Resolve a URI to a local path that can be read directly.
    fn resolve(&self, uri: &str) -> Result<PathBuf, ToolError>;
}

/// Storage backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ObjectStorage for LocalStorage {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, ToolError> {
        let relative = if let Some(path) = uri.strip_prefix("file://") {
            if path.starts_with('/') {
                return Ok(PathBuf::from(path));
            }
            path
        } else if let Some((scheme, rest)) = uri.split_once("://") {
            if !matches!(scheme, "s3" | "gs" | "gcs" | "az" | "abfs") {
                return Err(ToolError::SourceUnavailable(format!(
                    "unsupported storage scheme '{}' in {}",
                    scheme, uri
                )));
            }
            rest
        } else if Path::new(uri).is_absolute() {
            return Ok(PathBuf::from(uri));
        } else {
            uri
        };

        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(ToolError::SourceUnavailable(format!(
                "path escapes storage root: {}",
                uri
            )));
        }
        Ok(self.root.join(relative))
    }
}

/// Check that a resolved file exists and can be opened for reading.
pub async fn ensure_readable(path: &Path) -> Result<(), ToolError> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        ToolError::SourceUnavailable(format!("{}: {}", path.display(), e))
    })?;
    if !meta.is_file() {
        return Err(ToolError::SourceUnavailable(format!(
            "{} is not a file",
            path.display()
        )));
    }
    tokio::fs::File::open(path).await.map_err(|e| {
        ToolError::SourceUnavailable(format!("{}: {}", path.display(), e))
    })?;
    Ok(())
}
