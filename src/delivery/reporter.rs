//! Periodic queue depth reporter
//!
//! Logs how many payloads are waiting in the queue at a fixed interval until
//! cancelled. Useful for spotting backpressure from a slow sink.

use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::queue::QueueReceiver;

pub struct QueueReporter {
    queue: QueueReceiver,
    period: Duration,
}

impl QueueReporter {
    pub fn new(queue: QueueReceiver, period: Duration) -> Self {
        Self { queue, period }
    }

    /// Report until `cancel` fires. The first report comes after one period.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("queue reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    info!(
                        queue_size = self.queue.len(),
                        capacity = self.queue.capacity(),
                        "current queue size"
                    );
                }
            }
        }
    }
}
