//! # sfn-client
//!
//! Client side of the sfn connection engine.
//!
//! This crate provides:
//! - QUIC connect with the handshake exchange
//! - Credentials for every authentication strategy
//! - A background read loop delivering observed data to a handler
//! - Serialized frame writes and idempotent close

pub mod client;
pub mod credential;
pub mod error;
pub mod tls;

pub use client::{Client, ClientConfig, DataHandler, HandlerMode, StateObserver};
pub use credential::{signing_message, Credential};
pub use error::ClientError;
pub use tls::TlsClientConfig;
