//! Workflow definition.
//!
//! Workflows are YAML documents:
//!
//! ```yaml
//! name: processor-1
//! host: 0.0.0.0
//! port: 9000
//! functions:
//!   - name: normalize
//!   - name: enrich
//! downstreams:
//!   - name: processor-2
//!     host: 10.0.0.2
//!     port: 9000
//! ```
//!
//! Data from a source visits `functions` in declaration order.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// A stream function slot in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub name: String,
}

impl FunctionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A downstream processor that receives this processor's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl DownstreamConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Validated processor workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downstreams: Vec<DownstreamConfig>,
}

impl WorkflowConfig {
    /// Parses and validates a workflow from YAML.
    pub fn parse(yaml: &str) -> Result<Self, CoreError> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a workflow file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Single-function workflow used by dev mode.
    pub fn single(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        function: &str,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            functions: vec![FunctionConfig::new(function)],
            downstreams: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid("name is empty"));
        }
        if self.host.trim().is_empty() {
            return Err(CoreError::invalid("host is empty"));
        }
        if self.port == 0 {
            return Err(CoreError::invalid("port must be positive"));
        }

        let mut seen = HashSet::new();
        for (i, function) in self.functions.iter().enumerate() {
            if function.name.trim().is_empty() {
                return Err(CoreError::invalid(format!("functions[{}].name is empty", i)));
            }
            if !seen.insert(function.name.as_str()) {
                return Err(CoreError::invalid(format!(
                    "duplicate function name '{}'",
                    function.name
                )));
            }
        }

        for (i, downstream) in self.downstreams.iter().enumerate() {
            if downstream.name.trim().is_empty() {
                return Err(CoreError::invalid(format!("downstreams[{}].name is empty", i)));
            }
            if downstream.host.trim().is_empty() {
                return Err(CoreError::invalid(format!("downstreams[{}].host is empty", i)));
            }
            if downstream.port == 0 {
                return Err(CoreError::invalid(format!(
                    "downstreams[{}].port must be positive",
                    i
                )));
            }
        }

        Ok(())
    }

    /// Function names in pipeline order.
    pub fn function_names(&self) -> Vec<String> {
        self.functions.iter().map(|f| f.name.clone()).collect()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_yaml(&self) -> Result<String, CoreError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
