//! Structured logging context handed to each component
//!
//! Every long-running task gets a `LogContext` at construction and runs
//! inside its span, so log lines carry the run id and the emitting
//! component without a shared mutable logger.

use tracing::Span;
use uuid::Uuid;

/// Identifier for one process run, attached to every span
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a UUID-based correlation ID
    pub fn new_uuid() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new_uuid()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logging handle for one component
#[derive(Debug, Clone)]
pub struct LogContext {
    run_id: CorrelationId,
    span: Span,
}

impl LogContext {
    /// Root context for a process run
    pub fn root(process: &'static str) -> Self {
        let run_id = CorrelationId::new_uuid();
        let span = tracing::info_span!("forwarder", run_id = %run_id, process = process);
        Self { run_id, span }
    }

    /// Context for a named sub-component, sharing this run id
    pub fn child(&self, process: &'static str) -> Self {
        let span = tracing::info_span!(parent: &self.span, "component", process = process);
        Self {
            run_id: self.run_id.clone(),
            span,
        }
    }

    /// Context for one delivery worker
    pub fn worker(&self, worker_id: usize, draining: bool) -> Self {
        let span = tracing::info_span!(
            parent: &self.span,
            "worker",
            process = "eventProcessor",
            worker_id = worker_id,
            draining = draining
        );
        Self {
            run_id: self.run_id.clone(),
            span,
        }
    }

    pub fn run_id(&self) -> &CorrelationId {
        &self.run_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
