//! Telemetry source seam used by the collection engine.

use async_trait::async_trait;
use srl_gnmi_client::{Credentials, EventStream, GnmiClient, GnmiError};

/// Issues one-shot subscriptions and yields a finite stream of events.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn subscribe_once(
        &self,
        paths: &[String],
        credentials: Option<&Credentials>,
    ) -> Result<EventStream, GnmiError>;
}

#[async_trait]
impl TelemetrySource for GnmiClient {
    async fn subscribe_once(
        &self,
        paths: &[String],
        credentials: Option<&Credentials>,
    ) -> Result<EventStream, GnmiError> {
        GnmiClient::subscribe_once(self, paths, credentials).await
    }
}
