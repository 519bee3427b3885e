//! Data models for editrpc

pub mod config;

pub use config::{EditRpcConfig, LoggingConfig, ServerSettings};
