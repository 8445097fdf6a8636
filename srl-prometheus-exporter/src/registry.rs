//! Service registry client (Consul agent HTTP API).
//!
//! Requests go over a connection dialed inside the exporter's network
//! namespace, one HTTP/1.1 connection per request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::SystemIdentity;
use crate::model::{ExporterConfig, RegistrationConfig};
use crate::netns::Namespace;

/// Service name every exporter registers under.
pub const SERVICE_NAME: &str = "srl-prometheus-exporter";

/// Local agent address used when none is configured.
pub const DEFAULT_REGISTRY_ADDRESS: &str = "127.0.0.1:8500";

const DEFAULT_TTL: Duration = Duration::from_secs(10);
const DEFAULT_TTL_TEXT: &str = "10s";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry connection failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("Registry HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("Invalid registry request: {0}")]
    Request(String),
    #[error("Registry answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to encode service record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Registry request timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Service registration payload, in the registry's field naming.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Checks")]
    pub checks: Vec<ServiceCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceCheck {
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "Method", skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(rename = "Interval", skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(rename = "TLSSkipVerify", skip_serializing_if = "std::ops::Not::not")]
    pub tls_skip_verify: bool,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_after: String,
}

impl ServiceRecord {
    /// Record for this node's exporter.
    pub fn for_exporter(identity: &SystemIdentity, exporter: &ExporterConfig) -> Self {
        let registration = &exporter.registration;
        let (_, ttl) = effective_ttl(&registration.ttl);
        let address = identity.address().to_string();

        let port = exporter.bind_port.parse().unwrap_or_else(|_| {
            warn!(port = %exporter.bind_port, "Exporter port is not a number, registering port 0");
            0
        });

        let mut tags = registration.tags.clone();
        tags.extend(identity.tags());

        let mut checks = vec![ServiceCheck {
            ttl: Some(ttl.clone()),
            deregister_critical_after: ttl.clone(),
            ..Default::default()
        }];
        if registration.http_check_enabled {
            checks.push(ServiceCheck {
                http: Some(format!("http://{}:{}", address, exporter.bind_port)),
                method: Some("GET".to_string()),
                interval: Some(ttl.clone()),
                tls_skip_verify: true,
                deregister_critical_after: ttl,
                ..Default::default()
            });
        }

        Self {
            id: identity.name.clone(),
            name: SERVICE_NAME.to_string(),
            address,
            port,
            tags,
            checks,
        }
    }

    /// Id of the TTL check the heartbeat updates.
    pub fn ttl_check_id(&self) -> String {
        if self.checks.len() > 1 {
            format!("service:{}:1", self.id)
        } else {
            format!("service:{}", self.id)
        }
    }
}

/// Parse a duration in the `1h2m3.5s` / `500ms` notation.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let mut rest = s.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total_ns = 0f64;
    while !rest.is_empty() {
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        let (num, tail) = rest.split_at(end);
        let num: f64 = num.parse().ok()?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let unit_ns = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total_ns += num * unit_ns;
        rest = tail;
    }

    Some(Duration::from_nanos(total_ns.round() as u64))
}

/// TTL as a duration and as the text sent to the registry.
///
/// Empty, invalid or zero TTLs fall back to ten seconds.
pub fn effective_ttl(raw: &str) -> (Duration, String) {
    match parse_duration(raw) {
        Some(ttl) if !ttl.is_zero() => (ttl, raw.trim().to_string()),
        _ => {
            if !raw.is_empty() {
                warn!(ttl = %raw, "Invalid registration TTL, using {}", DEFAULT_TTL_TEXT);
            }
            (DEFAULT_TTL, DEFAULT_TTL_TEXT.to_string())
        }
    }
}

/// Operations on one registry agent.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register(&self, record: &ServiceRecord) -> Result<(), RegistryError>;

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError>;

    async fn update_health(&self, check_id: &str, status: HealthStatus) -> Result<(), RegistryError>;
}

/// Builds a verified client for the configured registry.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    async fn connect(
        &self,
        config: &RegistrationConfig,
        namespace: Arc<dyn Namespace>,
    ) -> Result<Box<dyn RegistryClient>, RegistryError>;
}

/// Connector for the Consul agent API.
#[derive(Debug, Clone)]
pub struct ConsulConnector {
    timeout: Duration,
}

impl ConsulConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RegistryConnector for ConsulConnector {
    async fn connect(
        &self,
        config: &RegistrationConfig,
        namespace: Arc<dyn Namespace>,
    ) -> Result<Box<dyn RegistryClient>, RegistryError> {
        let client = ConsulClient::new(config, namespace, self.timeout);
        let agent = client.request(Method::GET, "/v1/agent/self", None).await?;
        debug!(address = %client.address, bytes = agent.len(), "Connected to Consul agent");
        Ok(Box::new(client))
    }
}

pub struct ConsulClient {
    namespace: Arc<dyn Namespace>,
    address: String,
    token: String,
    basic_auth: Option<String>,
    timeout: Duration,
}

impl ConsulClient {
    pub fn new(config: &RegistrationConfig, namespace: Arc<dyn Namespace>, timeout: Duration) -> Self {
        let address = match config
            .registry_address
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/')
        {
            "" => DEFAULT_REGISTRY_ADDRESS.to_string(),
            address => address.to_string(),
        };
        let basic_auth = (!config.username.is_empty() && !config.password.is_empty()).then(|| {
            STANDARD.encode(format!("{}:{}", config.username, config.password))
        });

        Self {
            namespace,
            address,
            token: config.token.clone(),
            basic_auth,
            timeout,
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, RegistryError> {
        tokio::time::timeout(self.timeout, self.send(method, path, body))
            .await
            .map_err(|_| RegistryError::Timeout)?
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, RegistryError> {
        let stream = self.namespace.connect(&self.address, self.timeout).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Registry connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, self.address.as_str());
        if !self.token.is_empty() {
            builder = builder.header("X-Consul-Token", self.token.as_str());
        }
        if let Some(auth) = &self.basic_auth {
            builder = builder.header(header::AUTHORIZATION, format!("Basic {}", auth));
        }
        if body.is_some() {
            builder = builder.header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }
}

#[derive(Serialize)]
struct CheckUpdate<'a> {
    #[serde(rename = "Status")]
    status: &'a str,
    #[serde(rename = "Output")]
    output: &'a str,
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn register(&self, record: &ServiceRecord) -> Result<(), RegistryError> {
        let body = serde_json::to_vec(record)?;
        self.request(Method::PUT, "/v1/agent/service/register", Some(body))
            .await?;
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        let path = format!(
            "/v1/agent/service/deregister/{}",
            urlencoding::encode(service_id)
        );
        self.request(Method::PUT, &path, None).await?;
        Ok(())
    }

    async fn update_health(&self, check_id: &str, status: HealthStatus) -> Result<(), RegistryError> {
        let path = format!("/v1/agent/check/update/{}", urlencoding::encode(check_id));
        let body = serde_json::to_vec(&CheckUpdate {
            status: status.as_str(),
            output: "",
        })?;
        self.request(Method::PUT, &path, Some(body)).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory registry for tests.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub enum RegistryCall {
        Register(ServiceRecord),
        Deregister(String),
        Health(String),
    }

    /// Records calls; the first `connect_failures` connects fail, and
    /// heartbeats fail while `fail_health` is set.
    #[derive(Default)]
    pub struct FakeRegistry {
        pub calls: Mutex<Vec<RegistryCall>>,
        pub connects: AtomicUsize,
        pub connect_failures: AtomicUsize,
        pub fail_health: std::sync::atomic::AtomicBool,
    }

    impl FakeRegistry {
        pub fn calls(&self) -> Vec<RegistryCall> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: RegistryCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    pub struct FakeConnector(pub Arc<FakeRegistry>);

    struct FakeClient(Arc<FakeRegistry>);

    #[async_trait]
    impl RegistryConnector for FakeConnector {
        async fn connect(
            &self,
            _config: &RegistrationConfig,
            _namespace: Arc<dyn Namespace>,
        ) -> Result<Box<dyn RegistryClient>, RegistryError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            let remaining = self.0.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.0.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RegistryError::Timeout);
            }
            Ok(Box::new(FakeClient(self.0.clone())))
        }
    }

    #[async_trait]
    impl RegistryClient for FakeClient {
        async fn register(&self, record: &ServiceRecord) -> Result<(), RegistryError> {
            self.0.record(RegistryCall::Register(record.clone()));
            Ok(())
        }

        async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
            self.0.record(RegistryCall::Deregister(service_id.to_string()));
            Ok(())
        }

        async fn update_health(&self, check_id: &str, _status: HealthStatus) -> Result<(), RegistryError> {
            self.0.record(RegistryCall::Health(check_id.to_string()));
            if self.0.fail_health.load(Ordering::SeqCst) {
                return Err(RegistryError::Status {
                    status: 500,
                    body: "unavailable".to_string(),
                });
            }
            Ok(())
        }
    }
}
