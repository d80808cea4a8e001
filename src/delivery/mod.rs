//! Delivery worker pool
//!
//! Each worker takes one raw payload at a time from the shared queue, runs it
//! through the `Transformer` and hands the result to the `LogSink`. Workers
//! exit once the queue is closed and empty. Per-message failures are logged
//! and counted, never propagated: the message was already acknowledged
//! upstream when it entered the queue.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info};

use crate::queue::QueueReceiver;
use crate::sink::LogSink;
use crate::tracing_context::LogContext;
use crate::transform::{TransformedEvent, Transformer};

pub mod reporter;

pub use reporter::QueueReporter;

/// What happened to one dequeued payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Dropped,
    ParseError,
    SendError,
}

/// Per-outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub sent: u64,
    pub dropped: u64,
    pub parse_errors: u64,
    pub send_errors: u64,
}

impl DeliveryStats {
    pub fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Dropped => self.dropped += 1,
            DeliveryOutcome::ParseError => self.parse_errors += 1,
            DeliveryOutcome::SendError => self.send_errors += 1,
        }
    }

    pub fn merge(&mut self, other: DeliveryStats) {
        self.sent += other.sent;
        self.dropped += other.dropped;
        self.parse_errors += other.parse_errors;
        self.send_errors += other.send_errors;
    }

    /// Payloads taken off the queue, whatever their fate
    pub fn total(&self) -> u64 {
        self.sent + self.dropped + self.parse_errors + self.send_errors
    }
}

/// Handle on a set of running workers
pub struct WorkerPool {
    workers: JoinSet<DeliveryStats>,
    draining: bool,
}

impl WorkerPool {
    /// Spawn `count` workers reading from `queue`.
    ///
    /// `draining` only changes how the workers are labelled in logs; a drain
    /// pool is launched on an already closed queue and ends when it is empty.
    pub fn launch(
        count: usize,
        transformer: Arc<Transformer>,
        sink: Arc<dyn LogSink>,
        queue: QueueReceiver,
        log: &LogContext,
        draining: bool,
    ) -> Self {
        let mut workers = JoinSet::new();
        for worker_id in 0..count {
            let span = log.worker(worker_id, draining).span().clone();
            workers.spawn(
                run_worker(Arc::clone(&transformer), Arc::clone(&sink), queue.clone())
                    .instrument(span),
            );
        }
        info!(
            parent: log.span(),
            workers = count,
            draining,
            sink = sink.sink_type(),
            "delivery workers launched"
        );
        Self { workers, draining }
    }

    /// Wait for every worker to exit and return the merged counters
    pub async fn wait(mut self) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        while let Some(result) = self.workers.join_next().await {
            match result {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(e) => error!(error = %e, draining = self.draining, "delivery worker failed"),
            }
        }
        stats
    }
}

async fn run_worker(
    transformer: Arc<Transformer>,
    sink: Arc<dyn LogSink>,
    queue: QueueReceiver,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    while let Some(raw) = queue.recv().await {
        let outcome = deliver(&transformer, sink.as_ref(), &queue, &raw).await;
        stats.record(outcome);
    }
    debug!(?stats, "queue closed and empty, worker exiting");
    stats
}

/// Transform one raw payload and send it
pub async fn deliver(
    transformer: &Transformer,
    sink: &dyn LogSink,
    queue: &QueueReceiver,
    raw: &[u8],
) -> DeliveryOutcome {
    let (payload, log_type) = match transformer.transform(raw) {
        Ok(TransformedEvent::Forward { payload, log_type }) => (payload, log_type),
        Ok(TransformedEvent::Drop(reason)) => {
            debug!(?reason, "event dropped");
            return DeliveryOutcome::Dropped;
        }
        Err(e) => {
            error!(error = %e, "error transforming event");
            return DeliveryOutcome::ParseError;
        }
    };

    match sink.send(log_type.as_deref(), &payload).await {
        Ok(()) => {
            debug!(sink = sink.sink_type(), queue_size = queue.len(), "event sent");
            DeliveryOutcome::Sent
        }
        Err(e) => {
            error!(
                error = %e,
                sink = sink.sink_type(),
                queue_size = queue.len(),
                "error sending event"
            );
            DeliveryOutcome::SendError
        }
    }
}
