//! Exclusion rules applied to flattened events

use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Rule value that excludes an event whenever its key is present
pub const WILDCARD: &str = "*";

/// Value side of an exclusion rule
///
/// Matching compares the decoded JSON kind first, then the value of that
/// kind, so `"200"` never matches the number `200`.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    /// `"*"`: match any value
    Any,
    String(String),
    Number(Number),
    Bool(bool),
    Null,
}

impl RuleValue {
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (RuleValue::Any, _) => true,
            (RuleValue::String(expected), Value::String(actual)) => expected == actual,
            (RuleValue::Number(expected), Value::Number(actual)) => numbers_equal(expected, actual),
            (RuleValue::Bool(expected), Value::Bool(actual)) => expected == actual,
            (RuleValue::Null, Value::Null) => true,
            _ => false,
        }
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a == b;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl TryFrom<Value> for RuleValue {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) if s == WILDCARD => Ok(RuleValue::Any),
            Value::String(s) => Ok(RuleValue::String(s)),
            Value::Number(n) => Ok(RuleValue::Number(n)),
            Value::Bool(b) => Ok(RuleValue::Bool(b)),
            Value::Null => Ok(RuleValue::Null),
            Value::Array(_) | Value::Object(_) => {
                Err("exclusion values must be a string, number, boolean or null".to_string())
            }
        }
    }
}

/// Immutable set of exclusion rules keyed by flattened path
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "BTreeMap<String, Value>")]
pub struct ExclusionRules {
    rules: BTreeMap<String, RuleValue>,
}

impl TryFrom<BTreeMap<String, Value>> for ExclusionRules {
    type Error = String;

    fn try_from(raw: BTreeMap<String, Value>) -> Result<Self, Self::Error> {
        let mut rules = BTreeMap::new();
        for (key, value) in raw {
            let rule = RuleValue::try_from(value).map_err(|e| format!("excludeFilter.{}: {}", key, e))?;
            rules.insert(key, rule);
        }
        Ok(Self { rules })
    }
}

impl FromIterator<(String, RuleValue)> for ExclusionRules {
    fn from_iter<I: IntoIterator<Item = (String, RuleValue)>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

impl ExclusionRules {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the key of the first rule that excludes `flat`, if any
    pub fn first_match<'a>(&'a self, flat: &Map<String, Value>) -> Option<&'a str> {
        self.rules.iter().find_map(|(key, rule)| match flat.get(key) {
            Some(value) if rule.matches(value) => Some(key.as_str()),
            _ => None,
        })
    }
}
