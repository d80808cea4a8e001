//! STDOUT event sink implementation
//!
//! Dry-run sink that writes each transformed payload to standard output
//! instead of sending it. Useful for checking flattening and exclusion rules
//! against live traffic.

use async_trait::async_trait;
use std::io::Write;
use std::sync::{Arc, Mutex};

use super::{LogSink, SinkError};

/// Event sink that writes one payload per line
#[derive(Clone)]
pub struct StdoutSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl StdoutSink {
    /// Create a new STDOUT event sink
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    /// Write to an arbitrary stream instead of STDOUT
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogSink for StdoutSink {
    fn sink_type(&self) -> &'static str {
        "stdout"
    }

    async fn send(&self, _log_type: Option<&str>, payload: &[u8]) -> Result<(), SinkError> {
        // A poisoned lock only means another writer panicked mid-line; keep writing.
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(payload)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
