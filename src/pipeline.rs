//! Shutdown orchestrator
//!
//! Wires subscriber, queue, delivery workers and the optional queue reporter
//! together and sequences shutdown:
//!
//! 1. `Running`: workers consume while the subscriber fills the queue.
//! 2. `Stopping`: entered on the external stop signal or when the subscriber
//!    stops on its own. The subscriber is stopped, which closes the queue.
//! 3. `Draining`: a second set of workers joins the first on the closed queue
//!    until it is empty.
//! 4. `Stopped`: every worker has exited; nothing acknowledged is left queued.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::core::{ForwarderResult, PipelineSettings};
use crate::delivery::{DeliveryStats, QueueReporter, WorkerPool};
use crate::pubsub::{Subscriber, SubscriberSettings, Subscription};
use crate::sink::LogSink;
use crate::tracing_context::LogContext;
use crate::transform::Transformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Running,
    Stopping,
    Draining,
    Stopped,
}

pub struct Orchestrator {
    settings: PipelineSettings,
    subscriber_settings: SubscriberSettings,
    subscription: Arc<dyn Subscription>,
    transformer: Arc<Transformer>,
    sink: Arc<dyn LogSink>,
    log: LogContext,
    state: watch::Sender<OrchestratorState>,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        subscription: Arc<dyn Subscription>,
        transformer: Arc<Transformer>,
        sink: Arc<dyn LogSink>,
        log: LogContext,
    ) -> Self {
        let subscriber_settings = SubscriberSettings {
            enqueue_timeout: settings.enqueue_timeout,
            ..Default::default()
        };
        let (state, _) = watch::channel(OrchestratorState::Running);
        Self {
            settings,
            subscriber_settings,
            subscription,
            transformer,
            sink,
            log,
            state,
        }
    }

    /// Override subscriber tuning beyond what `PipelineSettings` carries
    pub fn with_subscriber_settings(mut self, subscriber_settings: SubscriberSettings) -> Self {
        self.subscriber_settings = subscriber_settings;
        self
    }

    /// Watch state transitions from outside `run`
    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    fn transition(&self, next: OrchestratorState) {
        info!(parent: self.log.span(), state = ?next, "pipeline state changed");
        self.state.send_replace(next);
    }

    /// Run the pipeline until `shutdown` resolves or the subscription ends,
    /// then drain the queue. Returns the delivery counters of the whole run.
    pub async fn run<F>(self, shutdown: F) -> ForwarderResult<DeliveryStats>
    where
        F: Future<Output = ()> + Send,
    {
        let workers = self.settings.workers;
        let mut subscriber = Subscriber::new(
            Arc::clone(&self.subscription),
            self.settings.queue_capacity,
            self.subscriber_settings.clone(),
            self.log.child("pubsubSubscriber"),
        );
        let queue = subscriber.data();

        let live = WorkerPool::launch(
            workers,
            Arc::clone(&self.transformer),
            Arc::clone(&self.sink),
            queue.clone(),
            &self.log,
            false,
        );

        let reporter_cancel = CancellationToken::new();
        let reporter = self.settings.report_interval.map(|period| {
            tokio::spawn(
                QueueReporter::new(queue.clone(), period)
                    .run(reporter_cancel.clone())
                    .instrument(self.log.child("queueReporter").span().clone()),
            )
        });

        if let Err(e) = subscriber.start() {
            reporter_cancel.cancel();
            subscriber.stop().await;
            live.wait().await;
            return Err(e);
        }
        self.transition(OrchestratorState::Running);

        let stopped = subscriber.stopped();
        tokio::select! {
            _ = shutdown => {
                info!(parent: self.log.span(), "stop requested");
            }
            _ = stopped => {
                warn!(parent: self.log.span(), "subscription ended, shutting down");
            }
        }

        self.transition(OrchestratorState::Stopping);
        reporter_cancel.cancel();
        // Also joins the receive loop when it already ended on its own.
        subscriber.stop().await;
        if let Some(reporter) = reporter
            && let Err(e) = reporter.await
        {
            error!(parent: self.log.span(), error = %e, "queue reporter failed");
        }

        self.transition(OrchestratorState::Draining);
        info!(parent: self.log.span(), queue_size = queue.len(), "draining queue");
        let drain = WorkerPool::launch(
            workers,
            Arc::clone(&self.transformer),
            Arc::clone(&self.sink),
            queue.clone(),
            &self.log,
            true,
        );
        let (mut stats, drained) = tokio::join!(live.wait(), drain.wait());
        stats.merge(drained);

        self.transition(OrchestratorState::Stopped);
        info!(
            parent: self.log.span(),
            sent = stats.sent,
            dropped = stats.dropped,
            parse_errors = stats.parse_errors,
            send_errors = stats.send_errors,
            "pipeline stopped"
        );
        Ok(stats)
    }
}
