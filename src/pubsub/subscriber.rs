//! Ingestion subscriber
//!
//! Runs the receive loop against a `Subscription`. Every pulled message gets
//! its own task that waits, up to a deadline, for a slot in the bounded
//! queue. The task's verdict (`Ack` when the payload was queued, `Nack`
//! otherwise) travels over a reply channel to a dispatcher that batches the
//! acknowledge / negative-acknowledge calls upstream.
//!
//! The receive loop owns the only `QueueSender`. When it exits, whether
//! because `stop` cancelled it or because the upstream gave up, it waits for
//! all message tasks, closes the queue, flushes outstanding replies and then
//! publishes `SubscriberState::Stopped`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::{AckReply, ReceivedMessage, Subscription};
use crate::core::{ForwarderError, ForwarderResult};
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::tracing_context::LogContext;

/// Largest number of replies sent upstream in one call
const ACK_BATCH_SIZE: usize = 1000;

/// Upper bound the upstream accepts for an ack deadline
const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);

/// Lease kept beyond the enqueue timeout so the ack lands before expiry
const ACK_DEADLINE_MARGIN: Duration = Duration::from_secs(10);

/// Longest enqueue timeout whose lease still fits in `MAX_ACK_DEADLINE`
pub const MAX_ENQUEUE_TIMEOUT: Duration =
    Duration::from_secs(MAX_ACK_DEADLINE.as_secs() - ACK_DEADLINE_MARGIN.as_secs());

/// Lifecycle of a subscriber; `Stopped` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Result of one attempt to place a payload on the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The deadline elapsed while the queue stayed full
    TimedOut,
    /// The subscriber was stopped while waiting
    Cancelled,
    /// Every receiver is gone
    Closed,
}

impl EnqueueOutcome {
    pub fn reply(self) -> AckReply {
        match self {
            EnqueueOutcome::Enqueued => AckReply::Ack,
            _ => AckReply::Nack,
        }
    }
}

/// Backoff for consecutive pull failures
#[derive(Debug, Clone)]
pub struct PullRetry {
    /// Consecutive failures after which the receive loop gives up
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PullRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl PullRetry {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Subscriber tuning
#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    /// Deadline for a message to find a queue slot before it is nacked
    pub enqueue_timeout: Duration,
    /// Upper bound for one pull request
    pub max_messages: usize,
    /// Messages pulled but not yet acked or nacked; pulling pauses at this bound
    pub max_outstanding: usize,
    /// Pause after an empty pull
    pub idle_delay: Duration,
    pub retry: PullRetry,
}

impl SubscriberSettings {
    /// Lease requested for freshly pulled messages
    pub fn ack_deadline(&self) -> Duration {
        (self.enqueue_timeout + ACK_DEADLINE_MARGIN).min(MAX_ACK_DEADLINE)
    }
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_secs(30),
            max_messages: 100,
            max_outstanding: 1000,
            idle_delay: Duration::from_millis(250),
            retry: PullRetry::default(),
        }
    }
}

/// Consumer of the upstream subscription feeding the bounded queue
pub struct Subscriber {
    subscription: Arc<dyn Subscription>,
    settings: SubscriberSettings,
    log: LogContext,
    sender: Option<QueueSender>,
    data: QueueReceiver,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SubscriberState>>,
    handle: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        queue_capacity: usize,
        settings: SubscriberSettings,
        log: LogContext,
    ) -> Self {
        let (sender, data) = queue::bounded(queue_capacity);
        let (state, _) = watch::channel(SubscriberState::Created);
        Self {
            subscription,
            settings,
            log,
            sender: Some(sender),
            data,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            handle: None,
        }
    }

    /// Receiving side of the bounded queue
    pub fn data(&self) -> QueueReceiver {
        self.data.clone()
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Resolves once the subscriber reaches `Stopped`, whatever the cause
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.subscribe();
        async move {
            // A dropped sender means the subscriber itself is gone.
            let _ = state
                .wait_for(|s| *s == SubscriberState::Stopped)
                .await;
        }
    }

    /// Spawn the receive loop
    pub fn start(&mut self) -> ForwarderResult<()> {
        if self.state() != SubscriberState::Created {
            return Err(ForwarderError::lifecycle(format!(
                "cannot start subscriber in state {:?}",
                self.state()
            )));
        }
        let Some(sender) = self.sender.take() else {
            return Err(ForwarderError::lifecycle("subscriber queue already closed"));
        };

        info!(parent: self.log.span(), subscription = self.subscription.name(), "starting ...");
        self.state.send_replace(SubscriberState::Running);

        let receive_loop = ReceiveLoop {
            subscription: Arc::clone(&self.subscription),
            settings: self.settings.clone(),
            sender,
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
        };
        self.handle = Some(tokio::spawn(
            receive_loop.run().instrument(self.log.span().clone()),
        ));
        Ok(())
    }

    /// Cancel the receive loop and wait until it has fully exited.
    ///
    /// When this returns the queue is closed and no further sends can happen.
    pub async fn stop(&mut self) {
        let _ = self.state.send_if_modified(|state| {
            if *state == SubscriberState::Running {
                *state = SubscriberState::Stopping;
                true
            } else {
                false
            }
        });
        warn!(parent: self.log.span(), "Stopping...");
        self.cancel.cancel();

        match self.handle.take() {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(parent: self.log.span(), error = %e, "receive loop panicked");
                    self.state.send_replace(SubscriberState::Stopped);
                }
            }
            None => {
                // Never started: closing the queue is all there is to do.
                self.sender.take();
                self.state.send_replace(SubscriberState::Stopped);
            }
        }
    }
}

struct ReceiveLoop {
    subscription: Arc<dyn Subscription>,
    settings: SubscriberSettings,
    sender: QueueSender,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SubscriberState>>,
}

impl ReceiveLoop {
    async fn run(self) {
        let ReceiveLoop {
            subscription,
            settings,
            sender,
            cancel,
            state,
        } = self;
        info!(subscription = subscription.name(), "consuming from pub/sub");

        let (reply_tx, reply_rx) = mpsc::channel(ACK_BATCH_SIZE);
        let dispatcher = tokio::spawn(
            dispatch_replies(Arc::clone(&subscription), reply_rx).in_current_span(),
        );

        let mut in_flight: JoinSet<AckReply> = JoinSet::new();
        let mut failures = 0u32;

        loop {
            while let Some(finished) = in_flight.try_join_next() {
                log_task_result(finished);
            }

            if in_flight.len() >= settings.max_outstanding.max(1) {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(finished) = in_flight.join_next() => log_task_result(finished),
                }
                continue;
            }

            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                pulled = subscription.pull(settings.max_messages) => pulled,
            };

            match pulled {
                Ok(messages) if messages.is_empty() => {
                    failures = 0;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(settings.idle_delay) => {}
                    }
                }
                Ok(messages) => {
                    failures = 0;
                    let ack_ids: Vec<String> =
                        messages.iter().map(|m| m.ack_id.clone()).collect();
                    let deadline = settings.ack_deadline();
                    match subscription.extend_ack_deadline(&ack_ids, deadline).await {
                        Ok(()) => debug!(count = ack_ids.len(), deadline = ?deadline, "extended ack deadline"),
                        Err(e) => warn!(error = %e, count = ack_ids.len(), "failed to extend ack deadline"),
                    }
                    for message in messages {
                        in_flight.spawn(
                            handle_message(
                                message,
                                sender.clone(),
                                reply_tx.clone(),
                                cancel.clone(),
                                settings.enqueue_timeout,
                            )
                            .in_current_span(),
                        );
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures >= settings.retry.max_attempts {
                        error!(error = %e, attempts = failures, "error consuming subscription");
                        break;
                    }
                    let delay = settings.retry.delay_for(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        max_attempts = settings.retry.max_attempts,
                        "pull failed, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let _ = state.send_if_modified(|s| {
            if *s == SubscriberState::Running {
                *s = SubscriberState::Stopping;
                true
            } else {
                false
            }
        });

        while let Some(finished) = in_flight.join_next().await {
            log_task_result(finished);
        }

        // The loop's sender is the last one once every message task is done.
        drop(sender);
        drop(reply_tx);
        if let Err(e) = dispatcher.await {
            error!(error = %e, "ack dispatcher panicked");
        }

        state.send_replace(SubscriberState::Stopped);
        info!("subscription receive loop exited");
    }
}

fn log_task_result(result: Result<AckReply, tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "message task failed");
    }
}

/// Wait for a queue slot, bounded by `timeout` and by `cancel`.
///
/// A free slot wins over a concurrent cancellation.
pub async fn enqueue_with_deadline(
    sender: &QueueSender,
    payload: Vec<u8>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> EnqueueOutcome {
    tokio::select! {
        biased;
        sent = sender.send(payload) => match sent {
            Ok(()) => EnqueueOutcome::Enqueued,
            Err(_) => EnqueueOutcome::Closed,
        },
        _ = cancel.cancelled() => EnqueueOutcome::Cancelled,
        _ = tokio::time::sleep(timeout) => EnqueueOutcome::TimedOut,
    }
}

async fn handle_message(
    message: ReceivedMessage,
    sender: QueueSender,
    replies: mpsc::Sender<(String, AckReply)>,
    cancel: CancellationToken,
    timeout: Duration,
) -> AckReply {
    let ReceivedMessage {
        ack_id,
        message_id,
        publish_time,
        data,
        ..
    } = message;

    let outcome = enqueue_with_deadline(&sender, data, &cancel, timeout).await;
    match outcome {
        EnqueueOutcome::Enqueued => {
            debug!(message_id = %message_id, publish_time = %publish_time, "message queued")
        }
        EnqueueOutcome::Cancelled => warn!(
            message_id = %message_id,
            "stopped before message could be queued, nacking"
        ),
        EnqueueOutcome::TimedOut => error!(
            message_id = %message_id,
            timeout = ?timeout,
            queue_size = sender.len(),
            "timed out waiting for queue slot, nacking"
        ),
        EnqueueOutcome::Closed => {
            error!(message_id = %message_id, "queue closed, nacking")
        }
    }

    let reply = outcome.reply();
    if replies.send((ack_id, reply)).await.is_err() {
        error!(message_id = %message_id, "ack dispatcher gone, reply lost");
    }
    reply
}

async fn dispatch_replies(
    subscription: Arc<dyn Subscription>,
    mut replies: mpsc::Receiver<(String, AckReply)>,
) {
    let mut batch = Vec::with_capacity(ACK_BATCH_SIZE);
    while replies.recv_many(&mut batch, ACK_BATCH_SIZE).await > 0 {
        let mut ack_ids = Vec::new();
        let mut nack_ids = Vec::new();
        for (ack_id, reply) in batch.drain(..) {
            match reply {
                AckReply::Ack => ack_ids.push(ack_id),
                AckReply::Nack => nack_ids.push(ack_id),
            }
        }

        if !ack_ids.is_empty() {
            match subscription.acknowledge(&ack_ids).await {
                Ok(()) => debug!(count = ack_ids.len(), "acknowledged messages"),
                Err(e) => error!(error = %e, count = ack_ids.len(), "failed to acknowledge messages"),
            }
        }
        if !nack_ids.is_empty() {
            match subscription.negative_acknowledge(&nack_ids).await {
                Ok(()) => debug!(count = nack_ids.len(), "nacked messages"),
                Err(e) => error!(error = %e, count = nack_ids.len(), "failed to nack messages"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::testing::{MockSubscription, message};
    use crate::pubsub::{AccessTokenProvider, RestSubscription};
    use mockito::{Matcher, Server};
    use reqwest::Client;
    use serde_json::json;

    fn fast_settings(enqueue_timeout: Duration) -> SubscriberSettings {
        SubscriberSettings {
            enqueue_timeout,
            idle_delay: Duration::from_millis(10),
            retry: PullRetry {
                max_attempts: 1,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_ack_once_enqueued() {
        let mock = Arc::new(MockSubscription::with_batches(vec![
            (0..3).map(message).collect(),
        ]));
        let mut subscriber = Subscriber::new(
            mock.clone(),
            10,
            fast_settings(Duration::from_secs(1)),
            LogContext::root("test"),
        );
        let data = subscriber.data();
        subscriber.start().unwrap();
        assert_eq!(subscriber.state(), SubscriberState::Running);

        wait_until(|| mock.acked().len() == 3).await;
        assert!(mock.nacked().is_empty());
        assert_eq!(data.len(), 3);

        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
        for _ in 0..3 {
            assert!(data.recv().await.is_some());
        }
        assert_eq!(data.recv().await, None);
    }

    #[tokio::test]
    async fn test_pulled_messages_are_leased_for_the_enqueue_wait() {
        let mock = Arc::new(MockSubscription::with_batches(vec![
            (0..2).map(message).collect(),
        ]));
        let mut subscriber = Subscriber::new(
            mock.clone(),
            4,
            fast_settings(Duration::from_secs(30)),
            LogContext::root("test"),
        );
        subscriber.start().unwrap();

        wait_until(|| mock.acked().len() == 2).await;
        subscriber.stop().await;

        assert_eq!(
            mock.extended(),
            vec![
                ("ack-0".to_string(), Duration::from_secs(40)),
                ("ack-1".to_string(), Duration::from_secs(40)),
            ]
        );
    }

    #[tokio::test]
    async fn test_rest_lease_extended_while_queue_is_full() {
        let mut server = Server::new_async().await;
        let pulled = json!({
            "receivedMessages": [
                { "ackId": "a1", "message": { "data": "e30=", "messageId": "m1" } },
                { "ackId": "a2", "message": { "data": "e30=", "messageId": "m2" } }
            ]
        });
        let _pull = server
            .mock("POST", "/v1/projects/proj/subscriptions/sub:pull")
            .with_status(200)
            .with_body(pulled.to_string())
            .create_async()
            .await;
        let extend = server
            .mock("POST", "/v1/projects/proj/subscriptions/sub:modifyAckDeadline")
            .match_body(Matcher::PartialJson(json!({ "ackDeadlineSeconds": 11 })))
            .with_status(200)
            .with_body("{}")
            .expect_at_least(1)
            .create_async()
            .await;
        let _nack = server
            .mock("POST", "/v1/projects/proj/subscriptions/sub:modifyAckDeadline")
            .match_body(Matcher::PartialJson(json!({ "ackDeadlineSeconds": 0 })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let _ack = server
            .mock("POST", "/v1/projects/proj/subscriptions/sub:acknowledge")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let rest = RestSubscription::with_base_url(
            server.url(),
            "proj",
            "sub",
            Client::new(),
            AccessTokenProvider::anonymous(Client::new()),
        );
        let settings = SubscriberSettings {
            max_outstanding: 2,
            ..fast_settings(Duration::from_millis(300))
        };
        let mut subscriber =
            Subscriber::new(Arc::new(rest), 1, settings, LogContext::root("test"));
        subscriber.start().unwrap();

        for _ in 0..200 {
            if extend.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        subscriber.stop().await;
        extend.assert_async().await;
    }

    #[test]
    fn test_ack_deadline_is_capped() {
        let settings = SubscriberSettings {
            enqueue_timeout: Duration::from_secs(900),
            ..Default::default()
        };
        assert_eq!(settings.ack_deadline(), MAX_ACK_DEADLINE);
        assert_eq!(MAX_ENQUEUE_TIMEOUT, Duration::from_secs(590));
    }

    #[tokio::test]
    async fn test_nack_when_queue_stays_full() {
        let mock = Arc::new(MockSubscription::with_batches(vec![
            (0..2).map(message).collect(),
        ]));
        let mut subscriber = Subscriber::new(
            mock.clone(),
            1,
            fast_settings(Duration::from_millis(50)),
            LogContext::root("test"),
        );
        subscriber.start().unwrap();

        wait_until(|| mock.acked().len() + mock.nacked().len() == 2).await;
        subscriber.stop().await;

        assert_eq!(mock.acked().len(), 1);
        assert_eq!(mock.nacked().len(), 1);
        assert_ne!(mock.acked()[0], mock.nacked()[0]);
    }

    #[tokio::test]
    async fn test_stop_nacks_messages_still_waiting() {
        let mock = Arc::new(MockSubscription::with_batches(vec![
            (0..2).map(message).collect(),
        ]));
        let mut subscriber = Subscriber::new(
            mock.clone(),
            1,
            fast_settings(Duration::from_secs(30)),
            LogContext::root("test"),
        );
        subscriber.start().unwrap();

        wait_until(|| mock.acked().len() == 1).await;
        subscriber.stop().await;

        // Replies are flushed before stop returns.
        assert_eq!(mock.acked().len(), 1);
        assert_eq!(mock.nacked().len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_stops_subscriber() {
        let mock = Arc::new(MockSubscription::default().failing_when_drained());
        let mut subscriber = Subscriber::new(
            mock,
            4,
            fast_settings(Duration::from_secs(1)),
            LogContext::root("test"),
        );
        let data = subscriber.data();
        let stopped = subscriber.stopped();
        subscriber.start().unwrap();

        tokio::time::timeout(Duration::from_secs(2), stopped)
            .await
            .expect("subscriber should stop on its own");
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
        assert_eq!(data.recv().await, None);

        // Stopping an already stopped subscriber is harmless.
        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let mock = Arc::new(MockSubscription::default());
        let mut subscriber = Subscriber::new(
            mock,
            4,
            fast_settings(Duration::from_secs(1)),
            LogContext::root("test"),
        );
        subscriber.start().unwrap();
        assert!(matches!(
            subscriber.start(),
            Err(ForwarderError::Lifecycle { .. })
        ));
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_closes_queue() {
        let mock = Arc::new(MockSubscription::default());
        let mut subscriber = Subscriber::new(
            mock,
            4,
            SubscriberSettings::default(),
            LogContext::root("test"),
        );
        let data = subscriber.data();
        subscriber.stop().await;

        assert_eq!(subscriber.state(), SubscriberState::Stopped);
        assert_eq!(data.recv().await, None);
        tokio::time::timeout(Duration::from_millis(100), subscriber.stopped())
            .await
            .unwrap();
        assert!(subscriber.start().is_err());
    }

    #[tokio::test]
    async fn test_free_slot_wins_over_cancellation() {
        let (sender, receiver) = queue::bounded(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome =
            enqueue_with_deadline(&sender, b"x".to_vec(), &cancel, Duration::from_secs(1)).await;
        assert_eq!(outcome, EnqueueOutcome::Enqueued);

        let outcome =
            enqueue_with_deadline(&sender, b"y".to_vec(), &cancel, Duration::from_secs(1)).await;
        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert_eq!(outcome.reply(), AckReply::Nack);
        assert_eq!(receiver.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_deadline_elapses() {
        let (sender, _receiver) = queue::bounded(1);
        sender.send(b"x".to_vec()).await.unwrap();

        let outcome = enqueue_with_deadline(
            &sender,
            b"y".to_vec(),
            &CancellationToken::new(),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(outcome, EnqueueOutcome::TimedOut);
    }

    #[test]
    fn test_pull_retry_backoff() {
        let retry = PullRetry::default();
        let delays: Vec<u64> = (1..=7).map(|n| retry.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
