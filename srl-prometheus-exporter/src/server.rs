//! Listener bring-up and serve loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentHandle;
use crate::http;
use crate::lifecycle::{ExporterSnapshot, LifecycleEvent};
use crate::netns::NamespaceResolver;

/// Binds the metrics listener inside the configured network instance,
/// retrying on a fixed interval, then serves until cancelled.
pub struct BringUp {
    pub agent: AgentHandle,
    pub resolver: Arc<dyn NamespaceResolver>,
    pub snapshot: watch::Receiver<ExporterSnapshot>,
    pub events: mpsc::UnboundedSender<LifecycleEvent>,
    pub retry_interval: Duration,
}

impl BringUp {
    pub async fn run(self, generation: u64, token: CancellationToken) {
        let (listener, path) = loop {
            match self.try_bind().await {
                Ok(bound) => break bound,
                Err(e) => {
                    warn!(error = %e, retry_in = ?self.retry_interval, "Exporter bring-up failed");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        };

        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.fail(generation, format!("listener has no local address: {}", e));
                return;
            }
        };
        let router = http::create_router(self.agent.clone(), &path);
        info!(%addr, path = %path, "HTTP server listening");
        let _ = self
            .events
            .send(LifecycleEvent::ListenerUp { generation, addr });

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .await;

        match result {
            Ok(()) if token.is_cancelled() => info!(%addr, "HTTP server stopped"),
            Ok(()) => self.fail(generation, "serve loop exited".to_string()),
            Err(e) => self.fail(generation, e.to_string()),
        }
    }

    /// One bring-up attempt: resolve the namespace, then bind.
    async fn try_bind(&self) -> anyhow::Result<(TcpListener, String)> {
        let snapshot = self.snapshot.borrow().clone();
        let exporter = &snapshot.exporter;

        let instance = snapshot.instance.as_ref().ok_or_else(|| {
            anyhow::anyhow!("unknown network instance '{}'", exporter.network_instance)
        })?;
        let namespace = self.resolver.resolve(&instance.namespace_name()).await?;

        let listen = exporter.listen_address();
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {}", listen, e))?;

        let listener = namespace
            .bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {} in {}: {}", addr, namespace.name(), e))?;

        Ok((listener, exporter.metrics_path()))
    }

    fn fail(&self, generation: u64, error: String) {
        warn!(error = %error, "HTTP server failed");
        let _ = self
            .events
            .send(LifecycleEvent::ListenerFailed { generation, error });
    }
}
