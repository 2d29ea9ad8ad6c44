//! Core error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from workflow loading and routing.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid workflow: {reason}")]
    InvalidWorkflow { reason: String },

    #[error("failed to read workflow {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidWorkflow {
            reason: reason.into(),
        }
    }
}
