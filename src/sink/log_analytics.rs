//! Log Analytics event sink
//!
//! Sends each transformed event as a signed HTTP POST to the workspace's
//! data collector endpoint. Exactly one attempt is made per call.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::signature::{self, CONTENT_TYPE};
use super::{LogSink, SinkError};
use crate::core::config::AzureConfig;
use crate::utils::timestamp::rfc1123_gmt_now;

/// Upper bound for a single request, so a hung endpoint cannot stall a worker forever
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Log Analytics sink configuration
#[derive(Clone)]
pub struct LogAnalyticsSinkConfig {
    /// Full ingestion URL, including the api-version query
    pub endpoint_url: String,
    pub workspace_id: String,
    /// Base64 shared secret
    pub workspace_key: String,
    /// Log type used when the event does not carry its own
    pub default_log_type: String,
    /// Name of the flattened field holding the event timestamp
    pub timestamp_field: String,
}

impl From<&AzureConfig> for LogAnalyticsSinkConfig {
    fn from(azure: &AzureConfig) -> Self {
        Self {
            endpoint_url: azure.endpoint_url(),
            workspace_id: azure.workspace_id.clone(),
            workspace_key: azure.workspace_key.clone(),
            default_log_type: azure.log_type.clone(),
            timestamp_field: azure.timestamp_field.clone(),
        }
    }
}

impl std::fmt::Debug for LogAnalyticsSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogAnalyticsSinkConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("workspace_id", &self.workspace_id)
            .field("default_log_type", &self.default_log_type)
            .field("timestamp_field", &self.timestamp_field)
            .finish_non_exhaustive()
    }
}

/// Sink posting events to the Log Analytics data collector API
#[derive(Clone, Debug)]
pub struct LogAnalyticsSink {
    config: LogAnalyticsSinkConfig,
    http_client: Client,
}

impl LogAnalyticsSink {
    pub fn new(config: LogAnalyticsSinkConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    pub fn with_client(config: LogAnalyticsSinkConfig, http_client: Client) -> Self {
        Self {
            config,
            http_client,
        }
    }

    fn build_request(
        &self,
        log_type: Option<&str>,
        payload: &[u8],
        date: &str,
    ) -> Result<RequestBuilder, SinkError> {
        let log_type = log_type
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.config.default_log_type);
        let authorization = signature::authorization(
            &self.config.workspace_id,
            &self.config.workspace_key,
            payload.len(),
            date,
        )?;

        Ok(self
            .http_client
            .post(&self.config.endpoint_url)
            .timeout(REQUEST_TIMEOUT)
            .header("Log-Type", log_type)
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("x-ms-date", date)
            .header("time-generated-field", &self.config.timestamp_field)
            .body(payload.to_vec()))
    }
}

#[async_trait]
impl LogSink for LogAnalyticsSink {
    fn sink_type(&self) -> &'static str {
        "log_analytics"
    }

    async fn send(&self, log_type: Option<&str>, payload: &[u8]) -> Result<(), SinkError> {
        let date = rfc1123_gmt_now();
        let request = self.build_request(log_type, payload, &date)?;

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(bytes = payload.len(), "Successfully sent event to Log Analytics");
        Ok(())
    }
}
