use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One tagged group of values received from a telemetry source.
///
/// A single gNMI notification update becomes one event: the list keys found
/// along the path become `tags`, the leaves below the update path become
/// `values`, keyed by their slash-separated path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Source timestamp in Unix epoch milliseconds (0 when unknown).
    #[serde(default)]
    pub timestamp: i64,

    /// List keys along the path, e.g. `interface_name -> ethernet-1/1`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Leaf values keyed by path, e.g. `/interface/statistics/in-octets`.
    #[serde(default)]
    pub values: BTreeMap<String, ScalarValue>,
}

impl TelemetryEvent {
    /// Create an empty event with the given timestamp.
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    /// Add a tag to this event.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a value to this event.
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

/// Scalar leaf value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    /// Coerce to a 64-bit float.
    ///
    /// Integers, floats and strings holding a decimal number convert;
    /// booleans and other strings do not.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Uint(u) => Some(*u as f64),
            ScalarValue::Float(f) => Some(*f),
            ScalarValue::Text(s) => s.trim().parse::<f64>().ok(),
            ScalarValue::Bool(_) => None,
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<u64> for ScalarValue {
    fn from(v: u64) -> Self {
        ScalarValue::Uint(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Text(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Text(v.to_string())
    }
}
