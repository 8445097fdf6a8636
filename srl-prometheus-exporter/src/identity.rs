//! System identity used for service registration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;
use srl_gnmi_client::path::path_to_xpath;
use srl_gnmi_client::proto::{PathElem, TypedValue, Update, typed_value};
use srl_gnmi_client::{
    Credentials, DataType, Encoding, GnmiClient, GnmiError, Notification, typed_value_to_string,
};
use thiserror::Error;
use tracing::debug;

const IDENTITY_PATHS: &[&str] = &[
    "/system/name/host-name",
    "/interface[name=mgmt0]/subinterface/ipv4/address/status",
    "/interface[name=mgmt0]/subinterface/ipv6/address/status",
    "/system/information/version",
    "/platform/chassis",
];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("System identity query failed: {0}")]
    Gnmi(#[from] GnmiError),
    #[error("System identity query timed out")]
    Timeout,
    #[error("System identity has no host name")]
    MissingName,
}

/// Name, management addresses and chassis details of the node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemIdentity {
    pub name: String,
    pub version: String,
    pub chassis_type: String,
    pub mac_address: String,
    pub part_number: String,
    pub serial_number: String,
    pub clei_code: String,
    pub ipv4: String,
    pub ipv6: String,
}

impl SystemIdentity {
    /// Management address, IPv4 preferred.
    pub fn address(&self) -> &str {
        if self.ipv4.is_empty() {
            &self.ipv6
        } else {
            &self.ipv4
        }
    }

    /// Tags describing the node, appended to the configured service tags.
    pub fn tags(&self) -> Vec<String> {
        vec![
            format!("version={}", self.version),
            format!("chassis-type={}", self.chassis_type),
            format!("chassis-mac-address={}", self.mac_address),
            format!("chassis-part-number={}", self.part_number),
            format!("chassis-serial-number={}", self.serial_number),
            format!("chassis-clei-code={}", self.clei_code),
        ]
    }

    /// Assemble the identity from `Get` notifications.
    pub fn from_notifications(notifications: &[Notification]) -> Self {
        let mut identity = Self::default();

        for notification in notifications {
            let prefix: &[PathElem] = notification
                .prefix
                .as_ref()
                .map(|p| p.elem.as_slice())
                .unwrap_or_default();

            for update in &notification.update {
                let mut elems = prefix.to_vec();
                if let Some(path) = &update.path {
                    elems.extend(path.elem.iter().cloned());
                }
                for elem in &mut elems {
                    elem.name = strip_module(&elem.name).to_string();
                }
                identity.absorb(&elems, update);
            }
        }

        identity
    }

    fn absorb(&mut self, elems: &[PathElem], update: &Update) {
        let path = path_to_xpath(elems);
        let Some(val) = &update.val else {
            return;
        };

        if path.starts_with("/interface") {
            let ip = elems
                .iter()
                .find(|e| e.name == "address")
                .and_then(|e| e.key.get("ip-prefix"))
                .map(|prefix| prefix.split('/').next().unwrap_or_default().to_string());
            if let Some(ip) = ip {
                if path.contains("/ipv4/address") {
                    self.ipv4 = ip;
                } else if path.contains("/ipv6/address") {
                    self.ipv6 = ip;
                }
            }
            return;
        }

        if path.ends_with("/platform/chassis") {
            if let Some(Json::Object(map)) = json_value(val) {
                for (key, value) in map {
                    let text = match value {
                        Json::String(s) => s,
                        other => other.to_string(),
                    };
                    self.set_chassis_leaf(strip_module(&key), text);
                }
            }
            return;
        }

        let Some(text) = typed_value_to_string(val) else {
            return;
        };
        if path.ends_with("/system/name/host-name") {
            self.name = text;
        } else if path.ends_with("/system/information/version") {
            self.version = text;
        } else if let Some(leaf) = path.strip_prefix("/platform/chassis/") {
            self.set_chassis_leaf(leaf, text);
        }
    }

    fn set_chassis_leaf(&mut self, leaf: &str, text: String) {
        match leaf {
            "type" => self.chassis_type = text,
            "mac-address" => self.mac_address = text,
            "part-number" => self.part_number = text,
            "serial-number" => self.serial_number = text,
            "clei-code" => self.clei_code = text,
            _ => {}
        }
    }
}

fn json_value(val: &TypedValue) -> Option<Json> {
    match val.value.as_ref()? {
        typed_value::Value::JsonVal(bytes) | typed_value::Value::JsonIetfVal(bytes) => {
            serde_json::from_slice(bytes).ok()
        }
        _ => None,
    }
}

fn strip_module(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, n)| n).unwrap_or(name)
}

/// Reads the node's identity.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn fetch(&self) -> Result<SystemIdentity, IdentityError>;
}

/// Identity read from the local gNMI server.
pub struct GnmiIdentitySource {
    client: Arc<GnmiClient>,
    credentials: Option<Credentials>,
    timeout: Duration,
}

impl GnmiIdentitySource {
    pub fn new(client: Arc<GnmiClient>, credentials: Option<Credentials>, timeout: Duration) -> Self {
        Self {
            client,
            credentials,
            timeout,
        }
    }
}

#[async_trait]
impl IdentitySource for GnmiIdentitySource {
    async fn fetch(&self) -> Result<SystemIdentity, IdentityError> {
        let notifications = tokio::time::timeout(
            self.timeout,
            self.client.get(
                IDENTITY_PATHS,
                DataType::State,
                Encoding::Ascii,
                self.credentials.as_ref(),
            ),
        )
        .await
        .map_err(|_| IdentityError::Timeout)??;

        let identity = SystemIdentity::from_notifications(&notifications);
        debug!(?identity, "System identity");
        if identity.name.is_empty() {
            return Err(IdentityError::MissingName);
        }
        Ok(identity)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted identity source for tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers queued results in order, then repeats the last one.
    pub struct ScriptedIdentity {
        answers: Mutex<VecDeque<Option<SystemIdentity>>>,
        last: Mutex<Option<SystemIdentity>>,
    }

    impl ScriptedIdentity {
        pub fn new(answers: impl IntoIterator<Item = Option<SystemIdentity>>) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().collect()),
                last: Mutex::new(None),
            }
        }

        pub fn named(name: &str) -> SystemIdentity {
            SystemIdentity {
                name: name.to_string(),
                ipv4: "172.20.20.2".to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl IdentitySource for ScriptedIdentity {
        async fn fetch(&self) -> Result<SystemIdentity, IdentityError> {
            let next = self.answers.lock().unwrap().pop_front();
            let answer = match next {
                Some(answer) => {
                    *self.last.lock().unwrap() = answer.clone();
                    answer
                }
                None => self.last.lock().unwrap().clone(),
            };
            answer.ok_or(IdentityError::MissingName)
        }
    }
}
