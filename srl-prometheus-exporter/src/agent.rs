//! The agent actor.
//!
//! A single task owns the [`ConfigStore`] and serializes everything that
//! touches it: configuration commits, network-instance changes, scrapes and
//! background task reports. A scrape therefore never interleaves with a
//! commit, and a commit waits for an in-flight scrape to finish.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::catalog::MetricCatalog;
use crate::collector::{CollectionEngine, ScrapeReport};
use crate::lifecycle::{Lifecycle, LifecycleDeps, LifecycleEvent, instance_action};
use crate::model::{ExporterConfig, MetricDefinition, NetworkInstanceRecord};
use crate::notification::{ConfigNotification, NetworkInstanceNotification, Operation};
use crate::store::ConfigStore;
use crate::transaction::TransactionProcessor;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent is not running")]
    Closed,
}

/// Requests served by the agent task.
#[derive(Debug)]
pub enum Command {
    Config(ConfigNotification),
    NetworkInstance(NetworkInstanceNotification),
    Scrape(oneshot::Sender<ScrapeReport>),
    Status(oneshot::Sender<AgentStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub exporter: ExporterConfig,
    pub listen_addr: Option<SocketAddr>,
    pub known_metrics: BTreeMap<String, MetricDefinition>,
    pub custom_metrics: BTreeMap<String, MetricDefinition>,
    pub server_running: bool,
    pub registration_running: bool,
    /// Notifications waiting for the next commit boundary.
    pub pending: usize,
}

/// Cloneable handle to the agent task.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
}

impl AgentHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Deliver one configuration notification.
    pub async fn config(&self, notification: ConfigNotification) -> Result<(), AgentError> {
        self.send(Command::Config(notification)).await
    }

    /// Deliver one network-instance notification.
    pub async fn network_instance(
        &self,
        notification: NetworkInstanceNotification,
    ) -> Result<(), AgentError> {
        self.send(Command::NetworkInstance(notification)).await
    }

    /// Run one scrape and wait for its samples.
    pub async fn scrape(&self) -> Result<ScrapeReport, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Scrape(reply)).await?;
        rx.await.map_err(|_| AgentError::Closed)
    }

    pub async fn status(&self) -> Result<AgentStatus, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        rx.await.map_err(|_| AgentError::Closed)
    }

    /// Stop the listener and registration, then end the agent task.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply)).await?;
        rx.await.map_err(|_| AgentError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), AgentError> {
        self.tx.send(command).await.map_err(|_| AgentError::Closed)
    }
}

pub struct Agent {
    store: ConfigStore,
    processor: TransactionProcessor,
    engine: CollectionEngine,
    lifecycle: Lifecycle,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl Agent {
    /// Spawn the agent task.
    ///
    /// The task ends on [`AgentHandle::shutdown`] or once every handle is
    /// dropped. A running listener holds a handle of its own, so a live
    /// exporter keeps the agent alive until shut down explicitly.
    pub fn spawn(
        catalog: Arc<MetricCatalog>,
        engine: CollectionEngine,
        deps: LifecycleDeps,
    ) -> (AgentHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events) = mpsc::unbounded_channel();

        let processor = TransactionProcessor::new(deps.mirror.clone());
        let lifecycle = Lifecycle::new(deps, events_tx, tx.downgrade());

        let agent = Agent {
            store: ConfigStore::new(catalog),
            processor,
            engine,
            lifecycle,
            commands,
            events,
        };
        let task = tokio::spawn(agent.run());
        (AgentHandle::new(tx), task)
    }

    async fn run(mut self) {
        info!(
            known_metrics = self.store.known_metrics().len(),
            "Agent started"
        );
        self.lifecycle.sync(&self.store);

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    self.lifecycle.on_event(&mut self.store, event).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.lifecycle.shutdown(&mut self.store).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => {
                        self.handle(command).await;
                        self.lifecycle.sync(&self.store);
                    }
                    None => {
                        self.lifecycle.shutdown(&mut self.store).await;
                        break;
                    }
                },
            }
        }

        info!("Agent stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Config(notification) => {
                self.processor
                    .on_notification(&mut self.store, notification, &mut self.lifecycle)
                    .await;
            }
            Command::NetworkInstance(notification) => {
                self.on_network_instance(notification).await;
            }
            Command::Scrape(reply) => {
                if reply.is_closed() {
                    debug!("Scrape requester went away, skipping");
                    return;
                }
                let report = self
                    .engine
                    .collect(&mut self.store, self.lifecycle.mirror())
                    .await;
                let _ = reply.send(report);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    async fn on_network_instance(&mut self, notification: NetworkInstanceNotification) {
        debug!(
            instance = %notification.name,
            op = ?notification.op,
            oper_up = notification.oper_up,
            "Network instance changed"
        );
        match notification.op {
            Operation::Delete => {
                self.store.remove_instance(&notification.name);
            }
            Operation::Create | Operation::Update => {
                self.store.upsert_instance(NetworkInstanceRecord {
                    name: notification.name.clone(),
                    base_name: notification.base_name.clone(),
                    oper_up: notification.oper_up,
                });
            }
        }
        self.lifecycle.sync(&self.store);

        if let Some(action) = instance_action(self.store.exporter(), &notification) {
            self.lifecycle.apply(&mut self.store, action).await;
        }
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            exporter: self.store.exporter().clone(),
            listen_addr: self.lifecycle.listen_addr(),
            known_metrics: self.store.known_metrics().clone(),
            custom_metrics: self.store.custom_metrics().clone(),
            server_running: self.lifecycle.server_running(),
            registration_running: self.lifecycle.registration_running(),
            pending: self.store.pending_len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A handle wired to a bare receiver, for driving handlers directly.
    pub fn handle_pair() -> (AgentHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(8);
        (AgentHandle::new(tx), rx)
    }
}
