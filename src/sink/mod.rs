//! Downstream sinks for transformed events
//!
//! Provides the `LogSink` trait and its two implementations: the signed
//! Log Analytics HTTP dispatcher and the dry-run STDOUT writer.

use async_trait::async_trait;
use thiserror::Error;

pub mod log_analytics;
pub mod signature;
pub mod stdout;

pub use log_analytics::{LogAnalyticsSink, LogAnalyticsSinkConfig};
pub use stdout::StdoutSink;

/// Errors raised by a single send attempt
#[derive(Error, Debug)]
pub enum SinkError {
    /// The shared secret cannot be used to sign requests
    #[error("error building signature: {message}")]
    Signature { message: String },

    /// The HTTP call itself failed
    #[error("error sending event: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with something other than 200
    #[error("error status {status}: {body}")]
    Status { status: u16, body: String },

    /// Writing to a local stream failed
    #[error("error writing event: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for transformed events. One call is one attempt; retry
/// policy belongs to the caller.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Short identifier used in logs
    fn sink_type(&self) -> &'static str;

    /// Send one payload. An empty or missing `log_type` selects the sink's default.
    async fn send(&self, log_type: Option<&str>, payload: &[u8]) -> Result<(), SinkError>;
}
