//! Core domain types for llamalink.
//!
//! This crate holds the pieces shared by the proxy server and the lifecycle
//! supervisor: the persisted [`Config`] and the process-wide [`ServiceState`].
//! It is deliberately free of HTTP and runtime dependencies.

#![deny(unsafe_code)]

pub mod config;
pub mod state;

pub use config::{
    Config, ConfigError, DEFAULT_OLLAMA_BASE_URL, DEFAULT_PORT, DEFAULT_TIMEOUT_SECS,
};
pub use state::ServiceState;
