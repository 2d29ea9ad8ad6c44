//! # sfn-core
//!
//! Workflow model and routing for sfn processors.
//!
//! This crate provides:
//! - Workflow file parsing and validation
//! - The route table: a fixed linear order of stream functions
//! - Forward-set computation for data leaving a stream function

pub mod error;
pub mod router;
pub mod workflow;

pub use error::CoreError;
pub use router::{Route, Router};
pub use workflow::{DownstreamConfig, FunctionConfig, WorkflowConfig};
