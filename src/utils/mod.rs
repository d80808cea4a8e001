//! Utility functions for the forwarder
//!
//! - Timestamp formatting and parsing

pub mod timestamp;

// Re-export for convenience
pub use timestamp::{format_rfc1123_gmt, parse_rfc3339_or_epoch, rfc1123_gmt_now};
