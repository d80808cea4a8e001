//! Upstream publish/subscribe boundary
//!
//! The `Subscription` trait is the seam between the forwarder and the
//! upstream pull API. `RestSubscription` talks to the real service (or its
//! emulator); the `Subscriber` drives any implementation through the
//! receive loop, the bounded queue and the ack/nack reply channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub mod auth;
pub mod rest;
pub mod subscriber;
#[cfg(test)]
pub(crate) mod testing;

pub use auth::AccessTokenProvider;
pub use rest::RestSubscription;
pub use subscriber::{
    EnqueueOutcome, MAX_ENQUEUE_TIMEOUT, PullRetry, Subscriber, SubscriberSettings,
    SubscriberState,
};

/// One message delivered by the upstream subscription
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Handle used to acknowledge or nack this delivery
    pub ack_id: String,
    pub message_id: String,
    pub publish_time: DateTime<Utc>,
    pub attributes: HashMap<String, String>,
    pub data: Vec<u8>,
}

/// Final verdict for a delivered message, sent exactly once per message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReply {
    /// Accepted into the queue; upstream will not redeliver
    Ack,
    /// Not accepted; upstream should redeliver
    Nack,
}

/// Errors from the upstream subscription API
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("error calling subscription API: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("subscription API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("error obtaining access token: {message}")]
    Auth { message: String },

    #[error("error decoding subscription response: {message}")]
    Decode { message: String },
}

impl SubscriptionError {
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

/// Pull-based upstream subscription
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Fully qualified subscription name, for logs
    fn name(&self) -> &str;

    /// Fetch up to `max_messages` messages. An empty batch is not an error.
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError>;

    /// Acknowledge deliveries so they are not redelivered
    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError>;

    /// Release deliveries for immediate redelivery
    async fn negative_acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError>;

    /// Keep deliveries leased for `deadline` from now, so they are not
    /// redelivered while still waiting to be queued
    async fn extend_ack_deadline(
        &self,
        ack_ids: &[String],
        deadline: Duration,
    ) -> Result<(), SubscriptionError>;
}
