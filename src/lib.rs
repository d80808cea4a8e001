//! Pub/Sub to Log Analytics forwarder
//!
//! Pulls JSON events from a Pub/Sub subscription, flattens and filters them,
//! and posts them to the Azure Log Analytics data collector API with a
//! shared-key signature. A bounded queue sits between the subscriber and a
//! pool of delivery workers; shutdown drains whatever was acknowledged but
//! not yet sent.

pub mod core;
pub mod delivery;
pub mod pipeline;
pub mod pubsub;
pub mod queue;
pub mod sink;
pub mod tracing_context;
pub mod transform;
pub mod utils;

pub use crate::core::{ForwarderConfig, ForwarderError, ForwarderResult, PipelineSettings};
pub use crate::delivery::DeliveryStats;
pub use crate::pipeline::{Orchestrator, OrchestratorState};
