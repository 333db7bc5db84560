// Error types shared by every backend
use crate::dataset::DatasetId;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by object store operations
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// The operation needs existing content and there is none
    #[error("object not found: {0}")]
    NotFound(String),

    /// A resolved path escapes its containment directory
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A remote put/get/head/delete call failed
    #[error("remote {operation} failed for key '{key}'")]
    Capability {
        operation: &'static str,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Malformed or inconsistent backend configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every candidate backend is above its fill limit
    #[error("no backend has room for dataset {0}")]
    StoreFull(DatasetId),

    #[error("dataset {dataset} is assigned to unknown backend '{backend_id}'")]
    UnknownBackend { dataset: DatasetId, backend_id: String },

    /// The assignment recorder refused or failed
    #[error("failed to record backend assignment: {0}")]
    Persistence(String),

    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

impl ObjectStoreError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn invalid_path(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn capability(operation: &'static str, key: &str, source: anyhow::Error) -> Self {
        Self::Capability {
            operation,
            key: key.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_invalid_path(&self) -> bool {
        matches!(self, Self::InvalidPath { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mentions_path() {
        let err = ObjectStoreError::io(
            "/tmp/objstore/missing.dat",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/objstore/missing.dat"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_kind_predicates() {
        assert!(ObjectStoreError::NotFound("dataset 1".into()).is_not_found());
        assert!(ObjectStoreError::invalid_path("../x", "escapes").is_invalid_path());
        assert!(!ObjectStoreError::Configuration("bad".into()).is_not_found());
    }
}
