//! In-memory subscription for tests

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{ReceivedMessage, Subscription, SubscriptionError};

/// Serves canned batches, then empty pulls (or errors), and records replies
#[derive(Default)]
pub struct MockSubscription {
    batches: Mutex<VecDeque<Vec<ReceivedMessage>>>,
    fail_when_drained: bool,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
    extended: Mutex<Vec<(String, Duration)>>,
}

impl MockSubscription {
    pub fn with_batches(batches: Vec<Vec<ReceivedMessage>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            ..Default::default()
        }
    }

    /// Fail every pull once the canned batches are used up
    pub fn failing_when_drained(self) -> Self {
        Self {
            fail_when_drained: true,
            ..self
        }
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        self.nacked.lock().unwrap().clone()
    }

    pub fn extended(&self) -> Vec<(String, Duration)> {
        self.extended.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subscription for MockSubscription {
    fn name(&self) -> &str {
        "projects/test/subscriptions/mock"
    }

    async fn pull(&self, _max_messages: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError> {
        match self.batches.lock().unwrap().pop_front() {
            Some(batch) => Ok(batch),
            None if self.fail_when_drained => Err(SubscriptionError::decode("upstream gone")),
            None => Ok(Vec::new()),
        }
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        self.acked.lock().unwrap().extend_from_slice(ack_ids);
        Ok(())
    }

    async fn negative_acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        self.nacked.lock().unwrap().extend_from_slice(ack_ids);
        Ok(())
    }

    async fn extend_ack_deadline(
        &self,
        ack_ids: &[String],
        deadline: Duration,
    ) -> Result<(), SubscriptionError> {
        self.extended
            .lock()
            .unwrap()
            .extend(ack_ids.iter().map(|id| (id.clone(), deadline)));
        Ok(())
    }
}

/// Message number `i` carrying `data`
pub fn message_with(i: usize, data: &[u8]) -> ReceivedMessage {
    ReceivedMessage {
        ack_id: format!("ack-{}", i),
        message_id: format!("m-{}", i),
        publish_time: Utc::now(),
        attributes: HashMap::new(),
        data: data.to_vec(),
    }
}

/// Message number `i` carrying `{"n": i}`
pub fn message(i: usize) -> ReceivedMessage {
    message_with(i, format!(r#"{{"n":{}}}"#, i).as_bytes())
}
