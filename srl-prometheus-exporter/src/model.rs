//! Exporter data model and its management-plane JSON shape.
//!
//! Leaves are wrapped the way the management plane encodes them
//! (`{"value": ...}`), enums use the YANG enumeration names
//! (`ADMIN_STATE_enable`, `OPER_STATE_up`, `STATE_enable`).

use serde::{Deserialize, Serialize};

/// Operator-declared desired state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminState {
    #[serde(rename = "ADMIN_STATE_enable")]
    Enable,
    #[default]
    #[serde(rename = "ADMIN_STATE_disable")]
    Disable,
}

/// Agent-observed actual state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperState {
    #[default]
    #[serde(rename = "OPER_STATE_down")]
    Down,
    #[serde(rename = "OPER_STATE_starting")]
    Starting,
    #[serde(rename = "OPER_STATE_up")]
    Up,
    #[serde(rename = "OPER_STATE_failed")]
    Failed,
}

impl std::fmt::Display for OperState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperState::Down => "down",
            OperState::Starting => "starting",
            OperState::Up => "up",
            OperState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Per-metric enable flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricState {
    #[serde(rename = "STATE_enable")]
    Enable,
    #[default]
    #[serde(rename = "STATE_disable")]
    Disable,
}

/// Singleton exporter configuration with its operational state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub admin_state: AdminState,
    #[serde(default)]
    pub oper_state: OperState,
    #[serde(default, with = "leaf")]
    pub network_instance: String,
    #[serde(default, rename = "address", with = "leaf")]
    pub bind_address: String,
    #[serde(default, rename = "port", with = "leaf")]
    pub bind_port: String,
    #[serde(default, with = "leaf")]
    pub http_path: String,
    #[serde(default, rename = "scrapes_count", with = "leaf")]
    pub scrape_count: u64,
    #[serde(default)]
    pub registration: RegistrationConfig,
}

impl ExporterConfig {
    /// Listen address as `host:port`, bracketing IPv6 literals.
    ///
    /// An empty address means all IPv4 interfaces.
    pub fn listen_address(&self) -> String {
        let host = if self.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            self.bind_address.as_str()
        };
        if host.contains(':') {
            format!("[{}]:{}", host, self.bind_port)
        } else {
            format!("{}:{}", host, self.bind_port)
        }
    }

    /// HTTP path of the metrics endpoint, `/` when unset.
    pub fn metrics_path(&self) -> String {
        if self.http_path.is_empty() {
            "/".to_string()
        } else if self.http_path.starts_with('/') {
            self.http_path.clone()
        } else {
            format!("/{}", self.http_path)
        }
    }
}

/// Service registry settings, nested in [`ExporterConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub admin_state: AdminState,
    #[serde(default)]
    pub oper_state: OperState,
    #[serde(default, rename = "address", with = "leaf")]
    pub registry_address: String,
    #[serde(default, with = "leaf")]
    pub username: String,
    #[serde(default, with = "leaf")]
    pub password: String,
    #[serde(default, with = "leaf")]
    pub token: String,
    #[serde(default, with = "leaf")]
    pub ttl: String,
    #[serde(default, rename = "http-check", with = "leaf")]
    pub http_check_enabled: bool,
    #[serde(default, with = "leaf_list")]
    pub tags: Vec<String>,
}

/// Which path-resolution policy applies to a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Paths come from the catalog, by name.
    Known,
    /// Paths come from configuration verbatim.
    Custom,
}

impl MetricKind {
    /// Object key wrapping the definition in the payload.
    pub fn envelope_key(self) -> &'static str {
        match self {
            MetricKind::Known => "metric",
            MetricKind::Custom => "custom_metric",
        }
    }
}

/// Shared `{state, help_text, paths}` payload of both metric kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    #[serde(default)]
    pub state: MetricState,
    #[serde(default, with = "leaf")]
    pub help_text: String,
    #[serde(default, with = "leaf_list")]
    pub paths: Vec<String>,
}

/// A named metric definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDefinition {
    pub name: String,
    pub kind: MetricKind,
    pub spec: MetricSpec,
}

impl MetricDefinition {
    /// A disabled definition with no paths.
    pub fn disabled(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            spec: MetricSpec::default(),
        }
    }

    /// Decode `{"<envelope>": {...}}` for the given kind.
    pub fn decode(
        name: impl Into<String>,
        kind: MetricKind,
        json: &str,
    ) -> Result<Self, serde_json::Error> {
        let mut value: serde_json::Value = serde_json::from_str(json)?;
        let inner = value
            .get_mut(kind.envelope_key())
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let spec: MetricSpec = serde_json::from_value(inner)?;
        Ok(Self {
            name: name.into(),
            kind,
            spec,
        })
    }

    /// Encode in the same envelope shape used by [`MetricDefinition::decode`].
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut envelope = serde_json::Map::new();
        envelope.insert(
            self.kind.envelope_key().to_string(),
            serde_json::to_value(&self.spec)?,
        );
        serde_json::to_string(&envelope)
    }

    pub fn is_enabled(&self) -> bool {
        self.spec.state == MetricState::Enable
    }
}

/// Externally owned routing domain mapped to an OS network namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInstanceRecord {
    pub name: String,
    pub base_name: String,
    pub oper_up: bool,
}

impl NetworkInstanceRecord {
    /// OS namespace name, e.g. `srbase-mgmt`.
    pub fn namespace_name(&self) -> String {
        format!("{}-{}", self.base_name, self.name)
    }
}

/// Serde adapter for leaves encoded as `{"value": x}`.
mod leaf {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct Out<'a, T> {
        value: &'a T,
    }

    #[derive(Deserialize)]
    #[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
    struct In<T> {
        #[serde(default)]
        value: T,
    }

    pub fn serialize<S: Serializer, T: Serialize>(value: &T, s: S) -> Result<S::Ok, S::Error> {
        Out { value }.serialize(s)
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Default,
    {
        Ok(In::<T>::deserialize(d)?.value)
    }
}

/// Serde adapter for leaf-lists encoded as `[{"value": x}, ...]`.
mod leaf_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Item {
        #[serde(default)]
        value: String,
    }

    pub fn serialize<S: Serializer>(values: &[String], s: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|v| Item { value: v.clone() })
            .collect::<Vec<_>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let items = Vec::<Item>::deserialize(d)?;
        Ok(items.into_iter().map(|i| i.value).collect())
    }
}
