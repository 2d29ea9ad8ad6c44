//! # sfn-server
//!
//! QUIC server and processor for sfn.
//!
//! This crate provides:
//! - QUIC connection handling with one frame stream per peer
//! - Handshake validation and pluggable authentication
//! - A registry of connected peers by name
//! - Data routing along the workflow and to downstream processors
//! - Prometheus metrics
//! - Dev-mode or file-based TLS

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod registry;
pub mod server;
pub mod tls;

pub use auth::{AuthOutcome, Authentication};
pub use config::{AuthConfig, Config, MetricsConfig, NetworkConfig, TlsConfig};
pub use error::ServerError;
pub use metrics::Metrics;
pub use processor::Processor;
pub use registry::{PeerInfo, Registry};
pub use server::{DataHandler, Server, ServerConfig, ServerStats};
