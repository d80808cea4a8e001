//! Core module containing fundamental types and configurations
//!
//! This module provides the basic building blocks for the forwarder,
//! including configuration management and error handling.

pub mod config;
pub mod errors;

// Re-export for convenience
pub use config::{ForwarderConfig, PipelineSettings, UpstreamEnvironment};
pub use errors::{ForwarderError, ForwarderResult};
