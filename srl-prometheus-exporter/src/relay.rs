//! Newline-delimited JSON relay to the host management plane.
//!
//! Inbound lines carry configuration and network-instance notifications;
//! outbound lines carry state upserts and deletes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::AgentHandle;
use crate::notification::{ConfigNotification, NetworkInstanceNotification};
use crate::publish::{PublishError, StatePublisher};

/// One inbound line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundMessage {
    Config(ConfigNotification),
    NetworkInstance(NetworkInstanceNotification),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum OutboundMessage<'a> {
    Upsert {
        path: &'a str,
        data: serde_json::Value,
    },
    Delete {
        path: &'a str,
    },
}

/// Forward every inbound line to the agent until end of input.
///
/// Returns early if the agent stops.
pub async fn run_feed<R: AsyncRead + Unpin>(reader: R, agent: AgentHandle) -> std::io::Result<()> {
    let mut lines = BufReader::new(reader).lines();
    let mut forwarded = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<InboundMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, line = %line, "Skipping malformed message");
                continue;
            }
        };

        let sent = match message {
            InboundMessage::Config(notification) => agent.config(notification).await,
            InboundMessage::NetworkInstance(notification) => {
                agent.network_instance(notification).await
            }
        };
        if sent.is_err() {
            warn!("Agent stopped, closing management feed");
            return Ok(());
        }
        forwarded += 1;
    }

    info!(forwarded, "Management feed closed");
    Ok(())
}

/// Writes state updates as JSON lines.
pub struct JsonLinesPublisher<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    async fn write(&self, message: &OutboundMessage<'_>) -> Result<(), PublishError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> StatePublisher for JsonLinesPublisher<W> {
    async fn upsert(&self, path: &str, json: &str) -> Result<(), PublishError> {
        let data = serde_json::from_str(json)?;
        debug!(path = %path, "Publishing state");
        self.write(&OutboundMessage::Upsert { path, data }).await
    }

    async fn delete(&self, path: &str) -> Result<(), PublishError> {
        debug!(path = %path, "Deleting state");
        self.write(&OutboundMessage::Delete { path }).await
    }
}
