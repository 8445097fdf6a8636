//! File configuration of the agent.
//!
//! Everything the management plane configures (exporter, metrics, registry)
//! arrives on the notification feed; this file only carries deployment
//! settings.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use srl_exporter_common::{LoggingConfig, load_config, parse_config};
use srl_gnmi_client::{Credentials, GnmiConfig};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] srl_exporter_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Metric catalog overrides: name to telemetry paths.
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<String>>,

    /// Username sent with every telemetry request.
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// gNMI server connection.
    #[serde(default)]
    pub gnmi: GnmiConfig,

    #[serde(default)]
    pub timers: TimersConfig,

    /// Network namespace handling.
    #[serde(default)]
    pub netns: NetnsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retry intervals and timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimersConfig {
    /// Fixed delay between bring-up and registration attempts (default: 2000).
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Bound on each metric fetch within a scrape (default: 2000).
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Grace period for stopping the listener (default: 1000).
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Bound on each state update pushed to the management plane (default: 2000).
    #[serde(default = "default_telemetry_timeout_ms")]
    pub telemetry_timeout_ms: u64,

    /// Bound on each registry call (default: 5000).
    #[serde(default = "default_registry_timeout_ms")]
    pub registry_timeout_ms: u64,
}

fn default_retry_interval_ms() -> u64 {
    2000
}

fn default_fetch_timeout_ms() -> u64 {
    2000
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

fn default_telemetry_timeout_ms() -> u64 {
    2000
}

fn default_registry_timeout_ms() -> u64 {
    5000
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            telemetry_timeout_ms: default_telemetry_timeout_ms(),
            registry_timeout_ms: default_registry_timeout_ms(),
        }
    }
}

impl TimersConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetnsConfig {
    /// Switch namespaces at all. When false, everything runs in the
    /// agent's own namespace (default: true).
    #[serde(default = "default_netns_enabled")]
    pub enabled: bool,

    /// Directory of named namespaces (default: "/var/run/netns").
    #[serde(default = "default_run_dir")]
    pub run_dir: String,
}

fn default_netns_enabled() -> bool {
    true
}

fn default_run_dir() -> String {
    "/var/run/netns".to_string()
}

impl Default for NetnsConfig {
    fn default() -> Self {
        Self {
            enabled: default_netns_enabled(),
            run_dir: default_run_dir(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: AgentConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timers = [
            ("retry_interval_ms", self.timers.retry_interval_ms),
            ("fetch_timeout_ms", self.timers.fetch_timeout_ms),
            ("shutdown_timeout_ms", self.timers.shutdown_timeout_ms),
            ("telemetry_timeout_ms", self.timers.telemetry_timeout_ms),
            ("registry_timeout_ms", self.timers.registry_timeout_ms),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be > 0", name)));
            }
        }

        if self.gnmi.address.is_empty() {
            return Err(ConfigError::Validation(
                "gnmi.address must not be empty".to_string(),
            ));
        }

        if let Some((name, _)) = self.metrics.iter().find(|(_, paths)| paths.is_empty()) {
            return Err(ConfigError::Validation(format!(
                "Metric '{}' has no paths",
                name
            )));
        }

        Ok(())
    }

    /// Telemetry credentials, if a username is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(&self.username, &self.password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srl_exporter_common::LogFormat;

    #[test]
    fn test_parse_minimal_config() {
        let config = AgentConfig::parse("{}").unwrap();

        assert!(config.metrics.is_empty());
        assert_eq!(config.credentials(), None);
        assert_eq!(config.gnmi, GnmiConfig::default());
        assert_eq!(config.timers.retry_interval(), Duration::from_secs(2));
        assert_eq!(config.timers.shutdown_timeout(), Duration::from_secs(1));
        assert_eq!(config.timers.registry_timeout(), Duration::from_secs(5));
        assert!(config.netns.enabled);
        assert_eq!(config.netns.run_dir, "/var/run/netns");
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            // catalog overrides
            metrics: {
                lldp: ["/system/lldp/statistics"],
                "evpn": ["/network-instance/protocols/bgp-evpn"],
            },
            username: "admin",
            password: "NokiaSrl1!",
            gnmi: { address: "127.0.0.1:57400", timeout_ms: 500 },
            timers: { retry_interval_ms: 250, fetch_timeout_ms: 3000 },
            netns: { enabled: false, run_dir: "/run/netns" },
            logging: { level: "debug", format: "json" }
        }"#;

        let config = AgentConfig::parse(json).unwrap();

        assert_eq!(config.metrics["lldp"], vec!["/system/lldp/statistics"]);
        assert_eq!(config.metrics.len(), 2);
        let creds = config.credentials().unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "NokiaSrl1!");
        assert_eq!(config.gnmi.address, "127.0.0.1:57400");
        assert_eq!(config.timers.retry_interval_ms, 250);
        assert_eq!(config.timers.fetch_timeout_ms, 3000);
        assert_eq!(config.timers.shutdown_timeout_ms, 1000);
        assert!(!config.netns.enabled);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validate_zero_timer() {
        let result = AgentConfig::parse("{ timers: { fetch_timeout_ms: 0 } }");
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("fetch_timeout_ms must be > 0")
        );
    }

    #[test]
    fn test_validate_empty_metric_paths() {
        let result = AgentConfig::parse("{ metrics: { bgp: [] } }");
        assert!(result.unwrap_err().to_string().contains("'bgp' has no paths"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = AgentConfig::load_from_file("/nonexistent/metrics.json5").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ username: "admin", timers: {{ retry_interval_ms: 500 }} }}"#).unwrap();

        let config = AgentConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.username, "admin");
        assert_eq!(config.timers.retry_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_empty_gnmi_address() {
        assert!(AgentConfig::parse(r#"{ gnmi: { address: "" } }"#).is_err());
    }
}
