//! Registry registration loop.
//!
//! Runs as a supervised task while the exporter is up. Each pass goes
//! `Connect -> Register -> Heartbeat`; any failure before registration
//! lands in `Retry`, which waits the fixed retry interval unless cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{IdentitySource, SystemIdentity};
use crate::lifecycle::{ExporterSnapshot, LifecycleEvent};
use crate::model::{AdminState, OperState};
use crate::netns::NamespaceResolver;
use crate::registry::{HealthStatus, RegistryClient, RegistryConnector, ServiceRecord, effective_ttl};

/// Shortest heartbeat period, whatever the TTL.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

enum Phase {
    Connect,
    Register {
        client: Box<dyn RegistryClient>,
        identity: SystemIdentity,
    },
    Heartbeat {
        client: Box<dyn RegistryClient>,
        session: Session,
    },
    Retry,
    Stopped,
}

/// A live registration.
struct Session {
    record: ServiceRecord,
    check_id: String,
    ttl: Duration,
}

pub struct RegistrationLoop {
    pub resolver: Arc<dyn NamespaceResolver>,
    pub connector: Arc<dyn RegistryConnector>,
    pub identity: Arc<dyn IdentitySource>,
    pub snapshot: watch::Receiver<ExporterSnapshot>,
    pub events: mpsc::UnboundedSender<LifecycleEvent>,
    pub retry_interval: Duration,
}

impl RegistrationLoop {
    pub async fn run(self, generation: u64, token: CancellationToken) {
        info!(generation, "Starting service registration");
        let mut phase = Phase::Connect;

        loop {
            phase = match phase {
                Phase::Connect => {
                    tokio::select! {
                        _ = token.cancelled() => Phase::Stopped,
                        next = self.connect() => next,
                    }
                }
                Phase::Register { client, identity } => {
                    self.register(generation, client, identity).await
                }
                Phase::Heartbeat { client, session } => {
                    self.heartbeat(generation, &token, client, session).await
                }
                Phase::Retry => {
                    tokio::select! {
                        _ = token.cancelled() => Phase::Stopped,
                        _ = tokio::time::sleep(self.retry_interval) => Phase::Connect,
                    }
                }
                Phase::Stopped => break,
            };
        }

        info!(generation, "Service registration stopped");
    }

    async fn connect(&self) -> Phase {
        let snapshot = self.snapshot.borrow().clone();
        let registration = &snapshot.exporter.registration;
        if registration.admin_state == AdminState::Disable {
            return Phase::Stopped;
        }

        let Some(instance) = snapshot.instance else {
            warn!(
                instance = %snapshot.exporter.network_instance,
                "Unknown network instance, retrying registration"
            );
            return Phase::Retry;
        };

        let namespace = match self.resolver.resolve(&instance.namespace_name()).await {
            Ok(ns) => ns,
            Err(e) => {
                warn!(error = %e, "Failed to resolve namespace for registration");
                return Phase::Retry;
            }
        };

        let client = match self.connector.connect(registration, namespace).await {
            Ok(client) => client,
            Err(e) => {
                warn!(address = %registration.registry_address, error = %e, "Failed to connect to registry");
                return Phase::Retry;
            }
        };

        match self.identity.fetch().await {
            Ok(identity) => Phase::Register { client, identity },
            Err(e) => {
                warn!(error = %e, "Failed to read system identity");
                Phase::Retry
            }
        }
    }

    async fn register(
        &self,
        generation: u64,
        client: Box<dyn RegistryClient>,
        identity: SystemIdentity,
    ) -> Phase {
        let exporter = self.snapshot.borrow().exporter.clone();
        let record = ServiceRecord::for_exporter(&identity, &exporter);
        let (ttl, _) = effective_ttl(&exporter.registration.ttl);

        info!(
            id = %record.id,
            address = %record.address,
            port = record.port,
            "Registering service"
        );
        if let Err(e) = client.register(&record).await {
            warn!(id = %record.id, error = %e, "Service registration failed");
            return Phase::Retry;
        }
        self.report(generation, OperState::Up);

        let check_id = record.ttl_check_id();
        if let Err(e) = client.update_health(&check_id, HealthStatus::Passing).await {
            warn!(check = %check_id, error = %e, "First TTL check update failed");
        }

        Phase::Heartbeat {
            client,
            session: Session {
                record,
                check_id,
                ttl,
            },
        }
    }

    async fn heartbeat(
        &self,
        generation: u64,
        token: &CancellationToken,
        client: Box<dyn RegistryClient>,
        session: Session,
    ) -> Phase {
        let period = (session.ttl / 2).max(MIN_HEARTBEAT);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    deregister(client.as_ref(), &session).await;
                    return Phase::Stopped;
                }
                _ = ticker.tick() => {}
            }

            let admin = self.snapshot.borrow().exporter.registration.admin_state;
            if admin == AdminState::Disable {
                deregister(client.as_ref(), &session).await;
                self.report(generation, OperState::Down);
                return Phase::Stopped;
            }

            match self.identity.fetch().await {
                Ok(identity) if identity.name == session.record.id => {
                    match client.update_health(&session.check_id, HealthStatus::Passing).await {
                        Ok(()) => debug!(check = %session.check_id, "TTL check passed"),
                        Err(e) => warn!(check = %session.check_id, error = %e, "TTL check update failed"),
                    }
                }
                Ok(identity) => {
                    info!(
                        old = %session.record.id,
                        new = %identity.name,
                        "System name changed, registering again"
                    );
                    deregister(client.as_ref(), &session).await;
                    self.report(generation, OperState::Starting);
                    return Phase::Connect;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to refresh system identity, registering again");
                    deregister(client.as_ref(), &session).await;
                    self.report(generation, OperState::Starting);
                    return Phase::Connect;
                }
            }
        }
    }

    fn report(&self, generation: u64, state: OperState) {
        let _ = self
            .events
            .send(LifecycleEvent::RegistrationState { generation, state });
    }
}

async fn deregister(client: &dyn RegistryClient, session: &Session) {
    match client.deregister(&session.record.id).await {
        Ok(()) => info!(id = %session.record.id, "Service deregistered"),
        Err(e) => warn!(id = %session.record.id, error = %e, "Service deregistration failed"),
    }
}
