//! Timestamp formatting utilities
//!
//! Provides the HTTP date rendering used by the ingestion request signature
//! and a parser for the RFC 3339 publish times reported upstream.

use chrono::{DateTime, Utc};

/// RFC 1123 layout with a literal `GMT` zone, e.g. `Mon, 02 Jan 2006 15:04:05 GMT`
const RFC1123_GMT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a UTC instant as an RFC 1123 date with a `GMT` suffix.
///
/// The ingestion API signs over this exact string and also expects it
/// verbatim in the `x-ms-date` header.
///
/// # Arguments
/// * `time` - The instant to format
///
/// # Returns
/// A `String` such as `"Tue, 05 Mar 2024 09:07:03 GMT"`
pub fn format_rfc1123_gmt(time: DateTime<Utc>) -> String {
    time.format(RFC1123_GMT).to_string()
}

/// Current time as an RFC 1123 `GMT` date string
pub fn rfc1123_gmt_now() -> String {
    format_rfc1123_gmt(Utc::now())
}

/// Parse an RFC 3339 timestamp, falling back to the Unix epoch when the
/// upstream omits or garbles it.
pub fn parse_rfc3339_or_epoch(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}
