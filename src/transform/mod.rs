//! Event transformation: flatten a JSON object into dot-joined keys and
//! apply exclusion rules.
//!
//! The transformer is pure. It holds an immutable rule set and the optional
//! name of the field carrying a per-event log type, and is shared across
//! workers behind an `Arc`.

pub mod rules;

pub use rules::{ExclusionRules, RuleValue, WILDCARD};

use crate::core::ForwarderConfig;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while transforming an event
#[derive(Error, Debug)]
pub enum TransformError {
    /// The payload is not valid JSON, or is valid JSON but not an object
    #[error("error parsing event: {message}")]
    Parse { message: String },

    #[error("error serializing event: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Why an event was dropped instead of forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// An exclusion rule on this key matched
    Excluded { key: String },
    /// Nothing left to forward after flattening
    Empty,
}

/// Result of a successful transformation
#[derive(Debug, Clone, PartialEq)]
pub enum TransformedEvent {
    Forward {
        payload: Vec<u8>,
        log_type: Option<String>,
    },
    Drop(DropReason),
}

/// Flattens, filters and re-serializes raw events
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    rules: ExclusionRules,
    log_type_field: Option<String>,
}

impl Transformer {
    pub fn new(rules: ExclusionRules, log_type_field: Option<String>) -> Self {
        Self {
            rules,
            log_type_field: log_type_field.filter(|f| !f.trim().is_empty()),
        }
    }

    pub fn from_config(config: &ForwarderConfig) -> Self {
        Self::new(
            config.exclude_filter.clone(),
            config.azure.log_type_field.clone(),
        )
    }

    pub fn transform(&self, raw: &[u8]) -> Result<TransformedEvent, TransformError> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| TransformError::Parse {
            message: e.to_string(),
        })?;
        let Value::Object(object) = value else {
            return Err(TransformError::Parse {
                message: "event is not a JSON object".to_string(),
            });
        };

        let flat = flatten(&object);

        let log_type = self
            .log_type_field
            .as_ref()
            .and_then(|field| flat.get(field))
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(key) = self.rules.first_match(&flat) {
            return Ok(TransformedEvent::Drop(DropReason::Excluded {
                key: key.to_string(),
            }));
        }
        if flat.is_empty() {
            return Ok(TransformedEvent::Drop(DropReason::Empty));
        }

        let payload = serde_json::to_vec(&Value::Object(flat)).map_err(TransformError::Serialize)?;
        Ok(TransformedEvent::Forward { payload, log_type })
    }
}

/// Flatten nested objects and arrays into a single-level map.
///
/// Object members join with `.`; array elements use their index as the path
/// segment. Empty nested objects and arrays contribute no keys.
pub fn flatten(object: &Map<String, Value>) -> Map<String, Value> {
    let mut flat = Map::new();
    for (key, value) in object {
        flatten_into(&mut flat, key.clone(), value);
    }
    flat
}

fn flatten_into(flat: &mut Map<String, Value>, path: String, value: &Value) {
    match value {
        Value::Object(children) => {
            for (key, child) in children {
                flatten_into(flat, format!("{}.{}", path, key), child);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_into(flat, format!("{}.{}", path, index), item);
            }
        }
        scalar => {
            flat.insert(path, scalar.clone());
        }
    }
}
