//! REST pull client for the upstream subscription
//!
//! Uses the `:pull`, `:acknowledge` and `:modifyAckDeadline` methods of the
//! Pub/Sub v1 REST API. A nack sets the ack deadline to zero, which makes
//! the message eligible for redelivery straight away.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{AccessTokenProvider, ReceivedMessage, Subscription, SubscriptionError};
use crate::core::config::GcpConfig;
use crate::core::{ForwarderResult, UpstreamEnvironment};
use crate::utils::timestamp::parse_rfc3339_or_epoch;

pub const PUBSUB_BASE_URL: &str = "https://pubsub.googleapis.com";

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WireMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    publish_time: Option<String>,
}

impl TryFrom<WireReceivedMessage> for ReceivedMessage {
    type Error = SubscriptionError;

    fn try_from(wire: WireReceivedMessage) -> Result<Self, Self::Error> {
        let data = match wire.message.data.as_deref() {
            Some(encoded) => BASE64_STANDARD.decode(encoded).map_err(|e| {
                SubscriptionError::decode(format!(
                    "message {} has invalid base64 data: {}",
                    wire.message.message_id, e
                ))
            })?,
            None => Vec::new(),
        };
        Ok(ReceivedMessage {
            ack_id: wire.ack_id,
            message_id: wire.message.message_id,
            publish_time: parse_rfc3339_or_epoch(wire.message.publish_time.as_deref()),
            attributes: wire.message.attributes,
            data,
        })
    }
}

/// Pull subscription over HTTP
pub struct RestSubscription {
    base_url: String,
    name: String,
    http_client: Client,
    tokens: AccessTokenProvider,
}

impl RestSubscription {
    /// Build a client for the configured subscription, honouring the emulator
    pub fn new(gcp: &GcpConfig, environment: &UpstreamEnvironment) -> ForwarderResult<Self> {
        let http_client = Client::new();
        let base_url = match environment {
            UpstreamEnvironment::Emulator { host } => format!("http://{}", host),
            UpstreamEnvironment::Credentials { .. } => PUBSUB_BASE_URL.to_string(),
        };
        let tokens = AccessTokenProvider::from_environment(environment, http_client.clone())?;
        Ok(Self::with_base_url(
            base_url,
            &gcp.project,
            &gcp.subscription,
            http_client,
            tokens,
        ))
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        project: &str,
        subscription: &str,
        http_client: Client,
        tokens: AccessTokenProvider,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            name: format!("projects/{}/subscriptions/{}", project, subscription),
            http_client,
            tokens,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/v1/{}:{}", self.base_url, self.name, method)
    }

    async fn modify_ack_deadline(
        &self,
        ack_ids: &[String],
        seconds: u64,
    ) -> Result<(), SubscriptionError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.call(
            "modifyAckDeadline",
            &json!({ "ackIds": ack_ids, "ackDeadlineSeconds": seconds }),
        )
        .await?;
        Ok(())
    }

    async fn call<B: Serialize + Sync>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<reqwest::Response, SubscriptionError> {
        let mut request = self.http_client.post(self.method_url(method)).json(body);
        if let Some(token) = self.tokens.token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(SubscriptionError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Subscription for RestSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError> {
        let response = self
            .call("pull", &json!({ "maxMessages": max_messages }))
            .await?;
        let body: PullResponse = response
            .json()
            .await
            .map_err(|e| SubscriptionError::decode(e.to_string()))?;
        debug!(count = body.received_messages.len(), "pulled messages");

        let mut messages = Vec::with_capacity(body.received_messages.len());
        let mut undecodable = Vec::new();
        for wire in body.received_messages {
            let ack_id = wire.ack_id.clone();
            match ReceivedMessage::try_from(wire) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    error!(error = %e, "dropping undecodable message");
                    undecodable.push(ack_id);
                }
            }
        }
        // Redelivery would fail the same way, so these are acked and lost.
        if !undecodable.is_empty()
            && let Err(e) = self.acknowledge(&undecodable).await
        {
            warn!(error = %e, count = undecodable.len(), "failed to acknowledge undecodable messages");
        }
        Ok(messages)
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.call("acknowledge", &json!({ "ackIds": ack_ids }))
            .await?;
        Ok(())
    }

    async fn negative_acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        self.modify_ack_deadline(ack_ids, 0).await
    }

    async fn extend_ack_deadline(
        &self,
        ack_ids: &[String],
        deadline: Duration,
    ) -> Result<(), SubscriptionError> {
        // Whole seconds on the wire; never round a lease down.
        let seconds = deadline.as_secs() + u64::from(deadline.subsec_nanos() > 0);
        self.modify_ack_deadline(ack_ids, seconds).await
    }
}
