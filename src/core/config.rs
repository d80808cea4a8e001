//! Configuration management for the forwarding bridge
//!
//! This module loads the YAML config file, validates every required field
//! before any component is constructed, and exposes the runtime knobs that
//! shape the delivery pipeline. The loaded configuration is immutable and is
//! shared as `Arc<ForwarderConfig>`.

use super::{ForwarderError, ForwarderResult};
use crate::pubsub::MAX_ENQUEUE_TIMEOUT;
use crate::transform::ExclusionRules;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default ingestion host, prefixed with the workspace ID
pub const DEFAULT_INGESTION_HOST: &str = "ods.opinsights.azure.com";

/// Ingestion API version sent on every request
pub const INGESTION_API_VERSION: &str = "2016-04-01";

/// Upstream subscription settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcpConfig {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub subscription: String,
}

/// Downstream workspace settings
#[derive(Clone, Default, Deserialize)]
pub struct AzureConfig {
    #[serde(default, rename = "workspaceID")]
    pub workspace_id: String,
    #[serde(default, rename = "workspaceKey")]
    pub workspace_key: String,
    #[serde(default, rename = "resourceGroup")]
    pub resource_group: String,
    #[serde(default, rename = "timestampField")]
    pub timestamp_field: String,
    #[serde(default, rename = "logType")]
    pub log_type: String,
    /// Flattened field whose string value overrides `log_type` per event
    #[serde(default, rename = "logTypeField")]
    pub log_type_field: Option<String>,
    #[serde(default, rename = "ingestionHost")]
    pub ingestion_host: Option<String>,
}

impl AzureConfig {
    /// Full ingestion URL for this workspace
    pub fn endpoint_url(&self) -> String {
        let host = self
            .ingestion_host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(DEFAULT_INGESTION_HOST);
        format!(
            "https://{}.{}/api/logs?api-version={}",
            self.workspace_id, host, INGESTION_API_VERSION
        )
    }
}

impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("workspace_id", &self.workspace_id)
            .field("workspace_key", &"[REDACTED]")
            .field("resource_group", &self.resource_group)
            .field("timestamp_field", &self.timestamp_field)
            .field("log_type", &self.log_type)
            .field("log_type_field", &self.log_type_field)
            .field("ingestion_host", &self.ingestion_host)
            .finish()
    }
}

/// Complete forwarder configuration as read from the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default)]
    pub gcp: GcpConfig,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default, rename = "excludeFilter")]
    pub exclude_filter: ExclusionRules,
}

impl ForwarderConfig {
    /// Load and validate configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ForwarderResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ForwarderError::config(format!(
                "could not read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_yaml(&raw)?;
        info!(
            path = %path.display(),
            subscription = %config.gcp.subscription,
            workspace_id = %config.azure.workspace_id,
            exclusion_rules = config.exclude_filter.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(raw: &str) -> ForwarderResult<Self> {
        let config: ForwarderConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every required field is present
    pub fn validate(&self) -> ForwarderResult<()> {
        let required = [
            (&self.gcp.project, "GCP Project ID not provided"),
            (&self.gcp.subscription, "GCP Subscription not provided"),
            (&self.azure.workspace_id, "Azure WorkspaceID not provided"),
            (&self.azure.workspace_key, "Azure WorkspaceKey not provided"),
            (&self.azure.resource_group, "Azure ResourceGroup not provided"),
            (&self.azure.log_type, "Azure LogType not provided"),
            (&self.azure.timestamp_field, "Azure TimestampField not provided"),
        ];
        for (value, message) in required {
            if value.trim().is_empty() {
                return Err(ForwarderError::config(message));
            }
        }

        if BASE64_STANDARD
            .decode(self.azure.workspace_key.trim())
            .is_err()
        {
            return Err(ForwarderError::config(
                "Azure WorkspaceKey must be valid base64",
            ));
        }

        if let Some(host) = &self.azure.ingestion_host
            && (host.contains("://") || host.contains('/'))
        {
            return Err(ForwarderError::config(
                "Azure IngestionHost must be a bare host name",
            ));
        }

        Ok(())
    }
}

/// Runtime knobs for the delivery pipeline, fixed for a run
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Number of delivery workers, for both the live and the drain pass
    pub workers: usize,
    /// Bounded queue capacity between subscriber and workers
    pub queue_capacity: usize,
    /// How long a message may wait for a queue slot before it is nacked
    pub enqueue_timeout: Duration,
    /// Interval for the queue depth reporter, `None` disables it
    pub report_interval: Option<Duration>,
    /// Write transformed payloads to stdout instead of sending them
    pub dry_run: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 1000,
            enqueue_timeout: Duration::from_secs(30),
            report_interval: Some(Duration::from_secs(30)),
            dry_run: false,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> ForwarderResult<()> {
        if self.workers == 0 {
            return Err(ForwarderError::config("threads must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ForwarderError::config("queue capacity must be at least 1"));
        }
        if self.enqueue_timeout.is_zero() {
            return Err(ForwarderError::config(
                "enqueue timeout must be greater than zero",
            ));
        }
        if self.enqueue_timeout > MAX_ENQUEUE_TIMEOUT {
            return Err(ForwarderError::config(format!(
                "enqueue timeout must be at most {}s",
                MAX_ENQUEUE_TIMEOUT.as_secs()
            )));
        }
        Ok(())
    }
}

/// How the upstream client reaches the subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEnvironment {
    /// Local emulator at `host:port`, no credentials needed
    Emulator { host: String },
    /// Production endpoint with a credentials file
    Credentials { path: PathBuf },
}

impl UpstreamEnvironment {
    /// Read `PUBSUB_EMULATOR_HOST` and `GOOGLE_APPLICATION_CREDENTIALS`
    pub fn from_env() -> ForwarderResult<Self> {
        Self::from_vars(
            env::var("PUBSUB_EMULATOR_HOST").ok(),
            env::var("GOOGLE_APPLICATION_CREDENTIALS").ok(),
        )
    }

    pub fn from_vars(
        emulator_host: Option<String>,
        credentials: Option<String>,
    ) -> ForwarderResult<Self> {
        if let Some(host) = emulator_host.filter(|h| !h.trim().is_empty()) {
            info!("Using Pub/Sub emulator at {}", host);
            return Ok(Self::Emulator { host });
        }

        let path = match credentials {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => {
                return Err(ForwarderError::credentials(
                    "GOOGLE_APPLICATION_CREDENTIALS not provided",
                ));
            }
        };
        if !path.is_file() {
            return Err(ForwarderError::credentials(format!(
                "GOOGLE_APPLICATION_CREDENTIALS path is invalid: {}",
                path.display()
            )));
        }
        Ok(Self::Credentials { path })
    }
}
