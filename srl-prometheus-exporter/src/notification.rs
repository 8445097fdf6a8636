//! Inbound management-plane notifications and the paths they address.

use serde::{Deserialize, Serialize};

/// Path of the exporter singleton.
pub const EXPORTER_PATH: &str = ".system.prometheus_exporter";
/// Path of known (catalog) metrics, keyed by name.
pub const METRIC_PATH: &str = ".system.prometheus_exporter.metric";
/// Path of custom metrics, keyed by name.
pub const CUSTOM_METRIC_PATH: &str = ".system.prometheus_exporter.custom_metric";
/// Reserved path marking the end of a configuration transaction.
pub const COMMIT_END_PATH: &str = ".commit.end";

/// Telemetry key of a known metric.
pub fn metric_state_key(name: &str) -> String {
    format!("{}{{.name==\"{}\"}}", METRIC_PATH, name)
}

/// Telemetry key of a custom metric.
pub fn custom_metric_state_key(name: &str) -> String {
    format!("{}{{.name==\"{}\"}}", CUSTOM_METRIC_PATH, name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One configuration change as delivered by the management plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigNotification {
    pub path: String,
    #[serde(default)]
    pub keys: Vec<String>,
    pub op: Operation,
    #[serde(default, deserialize_with = "json_payload")]
    pub data: String,
}

impl ConfigNotification {
    pub fn new(path: impl Into<String>, op: Operation, data: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            keys: Vec::new(),
            op,
            data: data.into(),
        }
    }

    /// Attach the list key (metric name).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// The transaction boundary marker.
    pub fn commit_end() -> Self {
        Self::new(COMMIT_END_PATH, Operation::Create, "")
    }

    pub fn is_commit_end(&self) -> bool {
        self.path == COMMIT_END_PATH
    }
}

/// Accept the payload either as a JSON string or as an inline JSON value.
fn json_payload<'de, D>(d: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(d)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Network-instance change from the namespace subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInstanceNotification {
    pub op: Operation,
    pub name: String,
    #[serde(default)]
    pub base_name: String,
    #[serde(default)]
    pub oper_up: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_keys() {
        assert_eq!(
            metric_state_key("lldp"),
            r#".system.prometheus_exporter.metric{.name=="lldp"}"#
        );
        assert_eq!(
            custom_metric_state_key("bfd"),
            r#".system.prometheus_exporter.custom_metric{.name=="bfd"}"#
        );
    }

    #[test]
    fn test_payload_inline_or_string() {
        let inline: ConfigNotification = serde_json::from_str(
            r#"{"path": ".system.prometheus_exporter", "op": "create", "data": {"admin_state": "ADMIN_STATE_enable"}}"#,
        )
        .unwrap();
        assert_eq!(inline.op, Operation::Create);
        assert!(inline.keys.is_empty());
        let data: serde_json::Value = serde_json::from_str(&inline.data).unwrap();
        assert_eq!(data["admin_state"], "ADMIN_STATE_enable");

        let quoted: ConfigNotification = serde_json::from_str(
            r#"{"path": ".system.prometheus_exporter.metric", "keys": ["lldp"], "op": "delete", "data": "{}"}"#,
        )
        .unwrap();
        assert_eq!(quoted.keys, vec!["lldp"]);
        assert_eq!(quoted.data, "{}");
    }

    #[test]
    fn test_commit_end() {
        assert!(ConfigNotification::commit_end().is_commit_end());
        assert!(!ConfigNotification::new(EXPORTER_PATH, Operation::Update, "{}").is_commit_end());
    }
}
