//! Mirroring of the exporter's own state back to the management plane.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{ExporterConfig, MetricDefinition, MetricKind};
use crate::notification::{EXPORTER_PATH, custom_metric_state_key, metric_state_key};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Telemetry channel closed")]
    Closed,
    #[error("Telemetry write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Telemetry encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Telemetry update timed out")]
    Timeout,
}

/// Outbound telemetry push interface of the management plane.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    /// Create or replace the state at `path`.
    async fn upsert(&self, path: &str, json: &str) -> Result<(), PublishError>;

    /// Remove the state at `path`.
    async fn delete(&self, path: &str) -> Result<(), PublishError>;
}

/// Projects store entries onto their telemetry keys.
///
/// Failures are logged and swallowed: mirroring never blocks a transition.
#[derive(Clone)]
pub struct StateMirror {
    publisher: Arc<dyn StatePublisher>,
    timeout: Duration,
}

impl StateMirror {
    pub fn new(publisher: Arc<dyn StatePublisher>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    pub async fn exporter(&self, config: &ExporterConfig) {
        match serde_json::to_string(config) {
            Ok(json) => self.upsert(EXPORTER_PATH, &json).await,
            Err(e) => warn!(error = %e, "Failed to encode exporter state"),
        }
    }

    pub async fn metric(&self, definition: &MetricDefinition) {
        let key = state_key(&definition.name, definition.kind);
        match definition.to_json() {
            Ok(json) => self.upsert(&key, &json).await,
            Err(e) => warn!(metric = %definition.name, error = %e, "Failed to encode metric state"),
        }
    }

    pub async fn remove_metric(&self, name: &str, kind: MetricKind) {
        let key = state_key(name, kind);
        let result = tokio::time::timeout(self.timeout, self.publisher.delete(&key))
            .await
            .unwrap_or(Err(PublishError::Timeout));
        match result {
            Ok(()) => debug!(path = %key, "Telemetry deleted"),
            Err(e) => warn!(path = %key, error = %e, "Failed to delete telemetry"),
        }
    }

    async fn upsert(&self, key: &str, json: &str) {
        let result = tokio::time::timeout(self.timeout, self.publisher.upsert(key, json))
            .await
            .unwrap_or(Err(PublishError::Timeout));
        match result {
            Ok(()) => debug!(path = %key, "Telemetry updated"),
            Err(e) => warn!(path = %key, error = %e, "Failed to update telemetry"),
        }
    }
}

fn state_key(name: &str, kind: MetricKind) -> String {
    match kind {
        MetricKind::Known => metric_state_key(name),
        MetricKind::Custom => custom_metric_state_key(name),
    }
}
