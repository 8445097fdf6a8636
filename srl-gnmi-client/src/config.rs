//! gNMI client configuration

use serde::{Deserialize, Serialize};

/// Connection settings for the local gNMI server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GnmiConfig {
    /// Server address: `unix:///path/to/socket` or `host:port`.
    #[serde(default = "default_address")]
    pub address: String,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Authentication credentials sent as gRPC metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Username for authentication
    pub username: String,

    /// Password for authentication
    pub password: String,
}

impl Credentials {
    /// Build credentials, or `None` when no username is configured.
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

fn default_address() -> String {
    "unix:///opt/srlinux/var/run/sr_gnmi_server".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for GnmiConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Where the client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GnmiAddress {
    Unix(String),
    Tcp(String),
}

impl GnmiConfig {
    /// Classify the configured address.
    pub fn target(&self) -> GnmiAddress {
        match self.address.strip_prefix("unix://") {
            Some(path) => GnmiAddress::Unix(path.to_string()),
            None => GnmiAddress::Tcp(self.address.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_local_unix_socket() {
        let config = GnmiConfig::default();
        assert_eq!(
            config.target(),
            GnmiAddress::Unix("/opt/srlinux/var/run/sr_gnmi_server".to_string())
        );
        assert_eq!(config.timeout_ms, 2000);
    }

    #[test]
    fn test_tcp_target() {
        let config = GnmiConfig {
            address: "127.0.0.1:57400".to_string(),
            ..Default::default()
        };
        assert_eq!(config.target(), GnmiAddress::Tcp("127.0.0.1:57400".to_string()));
    }

    #[test]
    fn test_credentials_require_username() {
        assert_eq!(Credentials::from_parts("", "secret"), None);
        let creds = Credentials::from_parts("admin", "NokiaSrl1!").unwrap();
        assert_eq!(creds.username, "admin");
    }
}
