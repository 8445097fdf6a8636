//! Exporter and registration state machines.
//!
//! The transition rules are pure functions of the stored config. Executing
//! an action is the job of [`Lifecycle`], which drives the [`Supervisor`]
//! and mirrors every state change.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::agent::{AgentHandle, Command};
use crate::config::TimersConfig;
use crate::identity::IdentitySource;
use crate::model::{AdminState, ExporterConfig, NetworkInstanceRecord, OperState};
use crate::netns::NamespaceResolver;
use crate::notification::{NetworkInstanceNotification, Operation};
use crate::publish::StateMirror;
use crate::registration::RegistrationLoop;
use crate::registry::RegistryConnector;
use crate::server::BringUp;
use crate::store::ConfigStore;
use crate::supervisor::{Role, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    StartExporter,
    StopExporter,
    StartRegistration,
    StopRegistration,
}

/// Reports from background tasks, tagged with the task generation.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    ListenerUp { generation: u64, addr: SocketAddr },
    ListenerFailed { generation: u64, error: String },
    RegistrationState { generation: u64, state: OperState },
}

/// What background tasks read of the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExporterSnapshot {
    pub exporter: ExporterConfig,
    /// Record of the configured network instance, if known.
    pub instance: Option<NetworkInstanceRecord>,
}

impl ExporterSnapshot {
    pub fn of(store: &ConfigStore) -> Self {
        Self {
            exporter: store.exporter().clone(),
            instance: store.configured_instance().cloned(),
        }
    }
}

/// Actions following an update of the exporter config.
///
/// `config` already carries the operational states preserved from before
/// the update.
pub fn exporter_update_actions(config: &ExporterConfig) -> Vec<LifecycleAction> {
    match (config.admin_state, config.oper_state) {
        (AdminState::Disable, oper) if oper != OperState::Down => vec![LifecycleAction::StopExporter],
        (AdminState::Enable, OperState::Down) => vec![LifecycleAction::StartExporter],
        (AdminState::Enable, OperState::Up) => registration_action(config).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Registration action for a running exporter.
pub fn registration_action(config: &ExporterConfig) -> Option<LifecycleAction> {
    let registration = &config.registration;
    match (registration.admin_state, registration.oper_state) {
        (AdminState::Enable, OperState::Down) => Some(LifecycleAction::StartRegistration),
        (AdminState::Disable, oper) if oper != OperState::Down => {
            Some(LifecycleAction::StopRegistration)
        }
        _ => None,
    }
}

/// Action following a change of a network instance.
///
/// Only the configured instance matters.
pub fn instance_action(
    config: &ExporterConfig,
    notification: &NetworkInstanceNotification,
) -> Option<LifecycleAction> {
    if notification.name != config.network_instance {
        return None;
    }

    let oper = config.oper_state;
    match notification.op {
        Operation::Create | Operation::Update if notification.oper_up => {
            (config.admin_state == AdminState::Enable && oper == OperState::Down)
                .then_some(LifecycleAction::StartExporter)
        }
        Operation::Create | Operation::Update => {
            matches!(oper, OperState::Up | OperState::Starting).then_some(LifecycleAction::StopExporter)
        }
        Operation::Delete => (oper != OperState::Down).then_some(LifecycleAction::StopExporter),
    }
}

/// Executes lifecycle actions. Implemented by [`Lifecycle`]; tests record.
pub(crate) trait ActionSink {
    async fn apply_action(&mut self, store: &mut ConfigStore, action: LifecycleAction);
}

/// Collaborators the background tasks need.
pub struct LifecycleDeps {
    pub resolver: Arc<dyn NamespaceResolver>,
    pub connector: Arc<dyn RegistryConnector>,
    pub identity: Arc<dyn IdentitySource>,
    pub mirror: StateMirror,
    pub timers: TimersConfig,
}

pub struct Lifecycle {
    supervisor: Supervisor,
    deps: LifecycleDeps,
    snapshot: watch::Sender<ExporterSnapshot>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    agent: mpsc::WeakSender<Command>,
    listen_addr: Option<SocketAddr>,
}

impl Lifecycle {
    pub fn new(
        deps: LifecycleDeps,
        events: mpsc::UnboundedSender<LifecycleEvent>,
        agent: mpsc::WeakSender<Command>,
    ) -> Self {
        let (snapshot, _) = watch::channel(ExporterSnapshot::default());
        Self {
            supervisor: Supervisor::new(),
            deps,
            snapshot,
            events,
            agent,
            listen_addr: None,
        }
    }

    /// Publish the store's current state to background tasks.
    pub fn sync(&self, store: &ConfigStore) {
        self.snapshot.send_replace(ExporterSnapshot::of(store));
    }

    pub fn mirror(&self) -> &StateMirror {
        &self.deps.mirror
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn server_running(&self) -> bool {
        self.supervisor.server_running()
    }

    pub fn registration_running(&self) -> bool {
        self.supervisor.registration_running()
    }

    pub async fn apply(&mut self, store: &mut ConfigStore, action: LifecycleAction) {
        debug!(?action, "Applying lifecycle action");
        match action {
            LifecycleAction::StartExporter => self.start_exporter(store).await,
            LifecycleAction::StopExporter => self.stop_exporter(store).await,
            LifecycleAction::StartRegistration => self.start_registration(store).await,
            LifecycleAction::StopRegistration => self.stop_registration(store).await,
        }
    }

    /// Handle a report from a background task. Stale generations are dropped.
    pub async fn on_event(&mut self, store: &mut ConfigStore, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ListenerUp { generation, addr } => {
                if !self.supervisor.is_current(Role::Server, generation) {
                    debug!(generation, "Ignoring stale listener report");
                    return;
                }
                info!(%addr, "Exporter up");
                self.listen_addr = Some(addr);
                store.exporter_mut().oper_state = OperState::Up;
                self.publish(store).await;

                if store.exporter().registration.admin_state == AdminState::Enable {
                    self.start_registration(store).await;
                }
            }
            LifecycleEvent::ListenerFailed { generation, error } => {
                if !self.supervisor.is_current(Role::Server, generation) {
                    debug!(generation, "Ignoring stale listener report");
                    return;
                }
                warn!(error = %error, "Listener failed, exporter down until reconfigured");
                self.stop_exporter(store).await;
            }
            LifecycleEvent::RegistrationState { generation, state } => {
                if !self.supervisor.is_current(Role::Registration, generation) {
                    debug!(generation, "Ignoring stale registration report");
                    return;
                }
                info!(state = %state, "Registration state changed");
                store.exporter_mut().registration.oper_state = state;
                self.publish(store).await;
            }
        }
    }

    /// Stop everything, as on agent shutdown.
    pub async fn shutdown(&mut self, store: &mut ConfigStore) {
        let running = self.supervisor.server_running() || self.supervisor.registration_running();
        if running || store.exporter().oper_state != OperState::Down {
            self.stop_exporter(store).await;
        }
    }

    async fn start_exporter(&mut self, store: &mut ConfigStore) {
        let Some(agent) = self.agent.upgrade() else {
            warn!("Agent is shutting down, not starting the exporter");
            return;
        };

        store.exporter_mut().oper_state = OperState::Starting;
        store.exporter_mut().registration.oper_state = OperState::Down;
        self.listen_addr = None;
        self.publish(store).await;

        let bring_up = BringUp {
            agent: AgentHandle::new(agent),
            resolver: Arc::clone(&self.deps.resolver),
            snapshot: self.snapshot.subscribe(),
            events: self.events.clone(),
            retry_interval: self.deps.timers.retry_interval(),
        };
        let generation = self
            .supervisor
            .replace_server(self.deps.timers.shutdown_timeout(), move |generation, token| {
                bring_up.run(generation, token)
            })
            .await;
        info!(generation, instance = %store.exporter().network_instance, "Exporter starting");
    }

    async fn stop_exporter(&mut self, store: &mut ConfigStore) {
        self.supervisor
            .stop_all(
                self.deps.timers.shutdown_timeout(),
                self.deps.timers.registry_timeout(),
            )
            .await;

        self.listen_addr = None;
        store.exporter_mut().oper_state = OperState::Down;
        store.exporter_mut().registration.oper_state = OperState::Down;
        self.publish(store).await;
        info!("Exporter down");
    }

    async fn start_registration(&mut self, store: &mut ConfigStore) {
        if !self.supervisor.server_running() {
            debug!("No listener running, registration deferred");
            return;
        }

        store.exporter_mut().registration.oper_state = OperState::Starting;
        self.publish(store).await;

        let task = RegistrationLoop {
            resolver: Arc::clone(&self.deps.resolver),
            connector: Arc::clone(&self.deps.connector),
            identity: Arc::clone(&self.deps.identity),
            snapshot: self.snapshot.subscribe(),
            events: self.events.clone(),
            retry_interval: self.deps.timers.retry_interval(),
        };
        let spawned = self
            .supervisor
            .replace_registration(self.deps.timers.registry_timeout(), move |generation, token| {
                task.run(generation, token)
            })
            .await;

        if spawned.is_none() {
            store.exporter_mut().registration.oper_state = OperState::Down;
            self.publish(store).await;
        }
    }

    async fn stop_registration(&mut self, store: &mut ConfigStore) {
        self.supervisor
            .stop_registration(self.deps.timers.registry_timeout())
            .await;
        store.exporter_mut().registration.oper_state = OperState::Down;
        self.publish(store).await;
    }

    async fn publish(&self, store: &ConfigStore) {
        self.sync(store);
        self.deps.mirror.exporter(store.exporter()).await;
    }
}

impl ActionSink for Lifecycle {
    async fn apply_action(&mut self, store: &mut ConfigStore, action: LifecycleAction) {
        self.apply(store, action).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MetricCatalog;
    use crate::identity::testing::ScriptedIdentity;
    use crate::model::RegistrationConfig;
    use crate::netns::HostResolver;
    use crate::publish::testing::RecordingPublisher;
    use crate::registry::testing::{FakeConnector, FakeRegistry, RegistryCall};
    use std::time::Duration;

    fn config(admin: AdminState, oper: OperState) -> ExporterConfig {
        ExporterConfig {
            admin_state: admin,
            oper_state: oper,
            network_instance: "mgmt".to_string(),
            ..Default::default()
        }
    }

    fn with_registration(mut config: ExporterConfig, admin: AdminState, oper: OperState) -> ExporterConfig {
        config.registration = RegistrationConfig {
            admin_state: admin,
            oper_state: oper,
            ..Default::default()
        };
        config
    }

    fn ni(op: Operation, name: &str, up: bool) -> NetworkInstanceNotification {
        NetworkInstanceNotification {
            op,
            name: name.to_string(),
            base_name: "srbase".to_string(),
            oper_up: up,
        }
    }

    #[test]
    fn test_exporter_update_rules() {
        use AdminState::*;
        use LifecycleAction::*;

        assert_eq!(exporter_update_actions(&config(Enable, OperState::Down)), vec![StartExporter]);
        assert_eq!(exporter_update_actions(&config(Disable, OperState::Up)), vec![StopExporter]);
        assert_eq!(exporter_update_actions(&config(Disable, OperState::Starting)), vec![StopExporter]);
        assert_eq!(exporter_update_actions(&config(Disable, OperState::Failed)), vec![StopExporter]);
        assert!(exporter_update_actions(&config(Disable, OperState::Down)).is_empty());
        assert!(exporter_update_actions(&config(Enable, OperState::Starting)).is_empty());
        assert!(exporter_update_actions(&config(Enable, OperState::Up)).is_empty());
    }

    #[test]
    fn test_registration_rules_need_running_exporter() {
        use AdminState::*;

        let up = config(Enable, OperState::Up);
        assert_eq!(
            exporter_update_actions(&with_registration(up.clone(), Enable, OperState::Down)),
            vec![LifecycleAction::StartRegistration]
        );
        assert_eq!(
            exporter_update_actions(&with_registration(up.clone(), Disable, OperState::Up)),
            vec![LifecycleAction::StopRegistration]
        );
        assert!(exporter_update_actions(&with_registration(up, Enable, OperState::Up)).is_empty());

        let starting = config(Enable, OperState::Starting);
        assert!(
            exporter_update_actions(&with_registration(starting, Enable, OperState::Down)).is_empty()
        );
    }

    #[test]
    fn test_instance_rules() {
        use AdminState::*;
        use LifecycleAction::*;

        let down = config(Enable, OperState::Down);
        assert_eq!(instance_action(&down, &ni(Operation::Create, "mgmt", true)), Some(StartExporter));
        assert_eq!(instance_action(&down, &ni(Operation::Update, "mgmt", true)), Some(StartExporter));
        assert_eq!(instance_action(&down, &ni(Operation::Update, "default", true)), None);
        assert_eq!(instance_action(&config(Disable, OperState::Down), &ni(Operation::Update, "mgmt", true)), None);

        let up = config(Enable, OperState::Up);
        assert_eq!(instance_action(&up, &ni(Operation::Update, "mgmt", false)), Some(StopExporter));
        assert_eq!(instance_action(&up, &ni(Operation::Update, "mgmt", true)), None);
        assert_eq!(instance_action(&up, &ni(Operation::Delete, "mgmt", true)), Some(StopExporter));
        assert_eq!(
            instance_action(&config(Enable, OperState::Starting), &ni(Operation::Update, "mgmt", false)),
            Some(StopExporter)
        );
        assert_eq!(instance_action(&down, &ni(Operation::Delete, "mgmt", false)), None);
        assert_eq!(instance_action(&up, &ni(Operation::Delete, "default", false)), None);
    }

    struct Rig {
        lifecycle: Lifecycle,
        store: ConfigStore,
        events: mpsc::UnboundedReceiver<LifecycleEvent>,
        registry: Arc<FakeRegistry>,
        _agent: mpsc::Sender<Command>,
        _commands: mpsc::Receiver<Command>,
    }

    impl Rig {
        fn new(registration: AdminState) -> Self {
            let (agent, commands) = mpsc::channel(8);
            let (events_tx, events) = mpsc::unbounded_channel();
            let registry = Arc::new(FakeRegistry::default());
            let deps = LifecycleDeps {
                resolver: Arc::new(HostResolver),
                connector: Arc::new(FakeConnector(registry.clone())),
                identity: Arc::new(ScriptedIdentity::new([Some(ScriptedIdentity::named("leaf1"))])),
                mirror: StateMirror::new(Arc::new(RecordingPublisher::default()), Duration::from_secs(1)),
                timers: TimersConfig {
                    retry_interval_ms: 50,
                    ..Default::default()
                },
            };

            let mut store = ConfigStore::new(Arc::new(MetricCatalog::builtin()));
            store.set_exporter(ExporterConfig {
                admin_state: AdminState::Enable,
                network_instance: "mgmt".to_string(),
                bind_address: "127.0.0.1".to_string(),
                bind_port: "0".to_string(),
                registration: RegistrationConfig {
                    admin_state: registration,
                    ttl: "10s".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            });
            store.upsert_instance(NetworkInstanceRecord {
                name: "mgmt".to_string(),
                base_name: "srbase".to_string(),
                oper_up: true,
            });

            Self {
                lifecycle: Lifecycle::new(deps, events_tx, agent.downgrade()),
                store,
                events,
                registry,
                _agent: agent,
                _commands: commands,
            }
        }

        async fn next_event(&mut self) -> LifecycleEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("no lifecycle event")
                .expect("event channel closed")
        }

        async fn deliver(&mut self, event: LifecycleEvent) {
            self.lifecycle.on_event(&mut self.store, event).await;
        }

        /// Start the exporter and feed back its listener report.
        async fn bring_up(&mut self) -> u64 {
            self.lifecycle
                .apply(&mut self.store, LifecycleAction::StartExporter)
                .await;
            let event = self.next_event().await;
            let LifecycleEvent::ListenerUp { generation, .. } = event else {
                panic!("unexpected event: {:?}", event);
            };
            self.deliver(event).await;
            generation
        }
    }

    #[tokio::test]
    async fn test_listener_failure_takes_exporter_down_for_good() {
        let mut rig = Rig::new(AdminState::Disable);
        let generation = rig.bring_up().await;
        assert_eq!(rig.store.exporter().oper_state, OperState::Up);
        assert!(rig.lifecycle.listen_addr().is_some());

        rig.deliver(LifecycleEvent::ListenerFailed {
            generation,
            error: "accept failed".to_string(),
        })
        .await;

        assert_eq!(rig.store.exporter().oper_state, OperState::Down);
        assert!(!rig.lifecycle.server_running());
        assert!(rig.lifecycle.listen_addr().is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rig.events.try_recv().is_err());
        assert!(!rig.lifecycle.server_running());
        assert_eq!(rig.store.exporter().oper_state, OperState::Down);
    }

    #[tokio::test]
    async fn test_stale_reports_are_ignored() {
        let mut rig = Rig::new(AdminState::Disable);
        let first = rig.bring_up().await;

        rig.deliver(LifecycleEvent::ListenerFailed {
            generation: first + 10,
            error: "late".to_string(),
        })
        .await;
        rig.deliver(LifecycleEvent::RegistrationState {
            generation: first,
            state: OperState::Up,
        })
        .await;
        assert_eq!(rig.store.exporter().oper_state, OperState::Up);
        assert_eq!(rig.store.exporter().registration.oper_state, OperState::Down);
        assert!(rig.lifecycle.server_running());

        // A restart leaves the first listener's reports stale.
        let second = rig.bring_up().await;
        assert!(second > first);

        rig.deliver(LifecycleEvent::ListenerFailed {
            generation: first,
            error: "old listener".to_string(),
        })
        .await;
        assert_eq!(rig.store.exporter().oper_state, OperState::Up);
        assert!(rig.lifecycle.server_running());
    }

    #[tokio::test]
    async fn test_registration_reports_update_oper_state() {
        let mut rig = Rig::new(AdminState::Enable);
        let server = rig.bring_up().await;
        assert!(rig.lifecycle.registration_running());
        assert_eq!(rig.store.exporter().registration.oper_state, OperState::Starting);

        let event = rig.next_event().await;
        let LifecycleEvent::RegistrationState { generation, state: OperState::Up } = event else {
            panic!("unexpected event: {:?}", event);
        };
        assert_ne!(generation, server);
        rig.deliver(event).await;
        assert_eq!(rig.store.exporter().registration.oper_state, OperState::Up);

        rig.deliver(LifecycleEvent::RegistrationState {
            generation: server,
            state: OperState::Down,
        })
        .await;
        assert_eq!(rig.store.exporter().registration.oper_state, OperState::Up);

        rig.deliver(LifecycleEvent::ListenerFailed {
            generation: server,
            error: "accept failed".to_string(),
        })
        .await;
        assert!(!rig.lifecycle.registration_running());
        assert_eq!(rig.store.exporter().registration.oper_state, OperState::Down);
        assert_eq!(
            rig.registry.calls().last(),
            Some(&RegistryCall::Deregister("leaf1".to_string()))
        );
    }
}
