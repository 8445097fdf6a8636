//! Commit-grouped application of configuration notifications.
//!
//! Notifications are buffered in the store until the boundary marker
//! arrives, then applied in arrival order. Each applied item may yield
//! lifecycle actions, which run before the next item is applied.

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{self, ActionSink, LifecycleAction};
use crate::model::{AdminState, ExporterConfig, MetricDefinition, MetricKind, OperState};
use crate::notification::{
    CUSTOM_METRIC_PATH, ConfigNotification, EXPORTER_PATH, METRIC_PATH, Operation,
};
use crate::publish::StateMirror;
use crate::store::ConfigStore;

/// Why a single notification was not applied.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("notification on {path} carries no key")]
    MissingKey { path: String },
    #[error("delete of the exporter configuration is not supported")]
    UnsupportedDelete,
    #[error("unknown configuration path: {0}")]
    UnknownPath(String),
    #[error("malformed payload on {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What one call to [`TransactionProcessor::on_notification`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Queued until the next boundary.
    Buffered,
    /// The boundary was processed.
    Applied { applied: usize, failed: usize },
    /// A keyless metric notification stopped the pass; the batch is queued again.
    Aborted,
}

pub struct TransactionProcessor {
    mirror: StateMirror,
}

impl TransactionProcessor {
    pub fn new(mirror: StateMirror) -> Self {
        Self { mirror }
    }

    pub(crate) async fn on_notification(
        &self,
        store: &mut ConfigStore,
        notification: ConfigNotification,
        sink: &mut impl ActionSink,
    ) -> Outcome {
        if !notification.is_commit_end() {
            debug!(path = %notification.path, op = ?notification.op, "Buffering notification");
            store.push_pending(notification);
            return Outcome::Buffered;
        }

        let batch = store.take_pending();
        if batch.is_empty() {
            debug!("Empty commit");
            return Outcome::Applied {
                applied: 0,
                failed: 0,
            };
        }

        let mut applied = 0;
        let mut failed = 0;
        let mut aborted = false;
        for (index, notification) in batch.iter().enumerate() {
            match self.apply(store, notification).await {
                Ok(actions) => {
                    applied += 1;
                    for action in actions {
                        sink.apply_action(store, action).await;
                    }
                }
                Err(e @ ApplyError::MissingKey { .. }) => {
                    error!(error = %e, index, "Aborting commit, batch kept for the next boundary");
                    aborted = true;
                    break;
                }
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, op = ?notification.op, "Skipping notification");
                }
            }
        }

        if aborted {
            store.restore_pending(batch);
            return Outcome::Aborted;
        }

        info!(applied, failed, "Commit applied");
        Outcome::Applied { applied, failed }
    }

    async fn apply(
        &self,
        store: &mut ConfigStore,
        notification: &ConfigNotification,
    ) -> Result<Vec<LifecycleAction>, ApplyError> {
        match notification.path.as_str() {
            EXPORTER_PATH => self.apply_exporter(store, notification).await,
            METRIC_PATH => {
                self.apply_metric(store, notification, MetricKind::Known)
                    .await?;
                Ok(Vec::new())
            }
            CUSTOM_METRIC_PATH => {
                self.apply_metric(store, notification, MetricKind::Custom)
                    .await?;
                Ok(Vec::new())
            }
            other => Err(ApplyError::UnknownPath(other.to_string())),
        }
    }

    async fn apply_exporter(
        &self,
        store: &mut ConfigStore,
        notification: &ConfigNotification,
    ) -> Result<Vec<LifecycleAction>, ApplyError> {
        if notification.op == Operation::Delete {
            return Err(ApplyError::UnsupportedDelete);
        }

        let mut config: ExporterConfig =
            serde_json::from_str(&notification.data).map_err(|source| ApplyError::Decode {
                path: notification.path.clone(),
                source,
            })?;

        let previous = store.exporter();
        config.scrape_count = previous.scrape_count;

        let actions = if notification.op == Operation::Create {
            config.oper_state = OperState::Down;
            config.registration.oper_state = OperState::Down;
            let start = config.admin_state == AdminState::Enable;
            store.set_exporter(config);
            if start {
                vec![LifecycleAction::StartExporter]
            } else {
                Vec::new()
            }
        } else {
            config.oper_state = previous.oper_state;
            config.registration.oper_state = previous.registration.oper_state;
            store.set_exporter(config);
            lifecycle::exporter_update_actions(store.exporter())
        };

        debug!(
            admin = ?store.exporter().admin_state,
            oper = %store.exporter().oper_state,
            ?actions,
            "Exporter config stored"
        );
        self.mirror.exporter(store.exporter()).await;
        Ok(actions)
    }

    async fn apply_metric(
        &self,
        store: &mut ConfigStore,
        notification: &ConfigNotification,
        kind: MetricKind,
    ) -> Result<(), ApplyError> {
        let name = notification
            .keys
            .first()
            .ok_or_else(|| ApplyError::MissingKey {
                path: notification.path.clone(),
            })?;

        if notification.op == Operation::Delete {
            match kind {
                MetricKind::Known => {
                    store.reset_known(name);
                }
                MetricKind::Custom => {
                    store.remove_custom(name);
                }
            }
            self.mirror.remove_metric(name, kind).await;
            debug!(metric = %name, ?kind, "Metric deleted");
            return Ok(());
        }

        let mut definition =
            MetricDefinition::decode(name.as_str(), kind, &notification.data).map_err(|source| {
                ApplyError::Decode {
                    path: notification.path.clone(),
                    source,
                }
            })?;
        if kind == MetricKind::Known {
            if !store.catalog().contains(name) {
                warn!(metric = %name, "Metric is not in the catalog and has no paths");
            }
            definition.spec.paths = store.catalog().paths(name).to_vec();
        }

        self.mirror.metric(&definition).await;
        debug!(
            metric = %name,
            ?kind,
            enabled = definition.is_enabled(),
            paths = definition.spec.paths.len(),
            "Metric stored"
        );
        store.upsert_metric(definition);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MetricCatalog;
    use crate::model::MetricState;
    use crate::notification::{custom_metric_state_key, metric_state_key};
    use crate::publish::testing::{Published, RecordingPublisher};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        actions: Vec<LifecycleAction>,
    }

    impl ActionSink for RecordingSink {
        async fn apply_action(&mut self, store: &mut ConfigStore, action: LifecycleAction) {
            // Mimic the exporter reaching `starting` so later rules see it.
            if action == LifecycleAction::StartExporter {
                store.exporter_mut().oper_state = OperState::Starting;
            }
            self.actions.push(action);
        }
    }

    struct Harness {
        store: ConfigStore,
        processor: TransactionProcessor,
        publisher: Arc<RecordingPublisher>,
        sink: RecordingSink,
    }

    impl Harness {
        fn new() -> Self {
            let publisher = Arc::new(RecordingPublisher::default());
            let mirror = StateMirror::new(publisher.clone(), Duration::from_secs(1));
            Self {
                store: ConfigStore::new(Arc::new(MetricCatalog::builtin())),
                processor: TransactionProcessor::new(mirror),
                publisher,
                sink: RecordingSink::default(),
            }
        }

        async fn send(&mut self, notification: ConfigNotification) -> Outcome {
            self.processor
                .on_notification(&mut self.store, notification, &mut self.sink)
                .await
        }

        async fn commit(&mut self) -> Outcome {
            self.send(ConfigNotification::commit_end()).await
        }
    }

    fn exporter(op: Operation, admin: &str) -> ConfigNotification {
        let data = format!(
            r#"{{"admin_state":"{}","network_instance":{{"value":"mgmt"}},"address":{{"value":"0.0.0.0"}},"port":{{"value":"9100"}}}}"#,
            admin
        );
        ConfigNotification::new(EXPORTER_PATH, op, data)
    }

    fn metric(path: &str, op: Operation, name: &str, data: &str) -> ConfigNotification {
        ConfigNotification::new(path, op, data).with_key(name)
    }

    #[tokio::test]
    async fn test_nothing_applies_before_boundary() {
        let mut h = Harness::new();

        let outcome = h.send(exporter(Operation::Create, "ADMIN_STATE_enable")).await;
        assert_eq!(outcome, Outcome::Buffered);
        assert_eq!(h.store.pending_len(), 1);
        assert_eq!(h.store.exporter().network_instance, "");
        assert!(h.sink.actions.is_empty());

        assert_eq!(h.commit().await, Outcome::Applied { applied: 1, failed: 0 });
        assert_eq!(h.store.pending_len(), 0);
        assert_eq!(h.store.exporter().network_instance, "mgmt");
        assert_eq!(h.store.exporter().bind_port, "9100");
        assert_eq!(h.sink.actions, vec![LifecycleAction::StartExporter]);
    }

    #[tokio::test]
    async fn test_empty_commit_is_noop() {
        let mut h = Harness::new();
        assert_eq!(h.commit().await, Outcome::Applied { applied: 0, failed: 0 });
        assert!(h.publisher.entries().is_empty());
        assert!(h.sink.actions.is_empty());
    }

    #[tokio::test]
    async fn test_create_forces_oper_down_and_keeps_counter() {
        let mut h = Harness::new();
        h.store.bump_scrape_count();
        h.store.bump_scrape_count();

        let data = r#"{"admin_state":"ADMIN_STATE_disable","oper_state":"OPER_STATE_up","scrapes_count":{"value":99},"registration":{"oper_state":"OPER_STATE_up"}}"#;
        h.send(ConfigNotification::new(EXPORTER_PATH, Operation::Create, data))
            .await;
        h.commit().await;

        let stored = h.store.exporter();
        assert_eq!(stored.oper_state, OperState::Down);
        assert_eq!(stored.registration.oper_state, OperState::Down);
        assert_eq!(stored.scrape_count, 2);
        assert!(h.sink.actions.is_empty());

        let mirrored = h.publisher.last_upsert(EXPORTER_PATH).unwrap();
        assert_eq!(mirrored["oper_state"], "OPER_STATE_down");
        assert_eq!(mirrored["scrapes_count"]["value"], 2);
    }

    #[tokio::test]
    async fn test_update_preserves_oper_states() {
        let mut h = Harness::new();
        h.send(exporter(Operation::Create, "ADMIN_STATE_enable")).await;
        h.commit().await;
        h.store.exporter_mut().oper_state = OperState::Up;
        h.store.exporter_mut().registration.oper_state = OperState::Up;

        h.send(exporter(Operation::Update, "ADMIN_STATE_disable")).await;
        h.commit().await;

        assert_eq!(h.store.exporter().admin_state, AdminState::Disable);
        assert_eq!(h.store.exporter().oper_state, OperState::Up);
        assert_eq!(h.store.exporter().registration.oper_state, OperState::Up);
        assert_eq!(
            h.sink.actions,
            vec![LifecycleAction::StartExporter, LifecycleAction::StopExporter]
        );
    }

    #[tokio::test]
    async fn test_actions_follow_arrival_order() {
        let mut h = Harness::new();
        h.send(exporter(Operation::Create, "ADMIN_STATE_enable")).await;
        h.send(exporter(Operation::Update, "ADMIN_STATE_disable")).await;
        h.commit().await;

        // The sink marked the exporter starting after the create, so the
        // disable in the same commit stops it again.
        assert_eq!(
            h.sink.actions,
            vec![LifecycleAction::StartExporter, LifecycleAction::StopExporter]
        );
    }

    #[tokio::test]
    async fn test_exporter_delete_is_rejected() {
        let mut h = Harness::new();
        h.send(exporter(Operation::Create, "ADMIN_STATE_disable")).await;
        h.send(ConfigNotification::new(EXPORTER_PATH, Operation::Delete, ""))
            .await;
        assert_eq!(h.commit().await, Outcome::Applied { applied: 1, failed: 1 });
        assert_eq!(h.store.exporter().network_instance, "mgmt");
    }

    #[tokio::test]
    async fn test_known_metric_uses_catalog_paths() {
        let mut h = Harness::new();
        let data = r#"{"metric":{"state":"STATE_enable","paths":[{"value":"/bogus"}]}}"#;
        h.send(metric(METRIC_PATH, Operation::Create, "lldp", data)).await;
        h.commit().await;

        let lldp = &h.store.known_metrics()["lldp"];
        assert!(lldp.is_enabled());
        assert_eq!(lldp.spec.paths, vec!["/system/lldp/interface/statistics"]);

        let mirrored = h.publisher.last_upsert(&metric_state_key("lldp")).unwrap();
        assert_eq!(mirrored["metric"]["state"], "STATE_enable");
        assert_eq!(
            mirrored["metric"]["paths"][0]["value"],
            "/system/lldp/interface/statistics"
        );
    }

    #[tokio::test]
    async fn test_known_delete_resets_custom_delete_removes() {
        let mut h = Harness::new();
        h.send(metric(
            METRIC_PATH,
            Operation::Create,
            "tcp",
            r#"{"metric":{"state":"STATE_enable"}}"#,
        ))
        .await;
        h.send(metric(
            CUSTOM_METRIC_PATH,
            Operation::Create,
            "ospf",
            r#"{"custom_metric":{"state":"STATE_enable","help_text":{"value":"OSPF"},"paths":[{"value":"/network-instance/protocols/ospf"}]}}"#,
        ))
        .await;
        h.commit().await;

        let ospf = &h.store.custom_metrics()["ospf"];
        assert_eq!(ospf.spec.paths, vec!["/network-instance/protocols/ospf"]);
        assert_eq!(ospf.spec.help_text, "OSPF");

        h.send(metric(METRIC_PATH, Operation::Delete, "tcp", "")).await;
        h.send(metric(CUSTOM_METRIC_PATH, Operation::Delete, "ospf", ""))
            .await;
        h.commit().await;

        let tcp = &h.store.known_metrics()["tcp"];
        assert_eq!(tcp.spec.state, MetricState::Disable);
        assert!(tcp.spec.paths.is_empty());
        assert!(!h.store.custom_metrics().contains_key("ospf"));

        let entries = h.publisher.entries();
        assert!(entries.contains(&Published::Delete(metric_state_key("tcp"))));
        assert!(entries.contains(&Published::Delete(custom_metric_state_key("ospf"))));
    }

    #[tokio::test]
    async fn test_decode_error_skips_only_that_item() {
        let mut h = Harness::new();
        h.send(metric(METRIC_PATH, Operation::Update, "bgp", "{not json"))
            .await;
        h.send(metric(
            METRIC_PATH,
            Operation::Update,
            "isis",
            r#"{"metric":{"state":"STATE_enable"}}"#,
        ))
        .await;

        assert_eq!(h.commit().await, Outcome::Applied { applied: 1, failed: 1 });
        assert!(!h.store.known_metrics()["bgp"].is_enabled());
        assert!(h.store.known_metrics()["isis"].is_enabled());
    }

    #[tokio::test]
    async fn test_unknown_path_is_skipped() {
        let mut h = Harness::new();
        h.send(ConfigNotification::new(".system.snmp", Operation::Create, "{}"))
            .await;
        assert_eq!(h.commit().await, Outcome::Applied { applied: 0, failed: 1 });
        assert_eq!(h.store.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_missing_key_aborts_and_keeps_batch() {
        let mut h = Harness::new();
        h.send(exporter(Operation::Create, "ADMIN_STATE_disable")).await;
        h.send(ConfigNotification::new(
            METRIC_PATH,
            Operation::Create,
            r#"{"metric":{"state":"STATE_enable"}}"#,
        ))
        .await;

        assert_eq!(h.commit().await, Outcome::Aborted);
        assert_eq!(h.store.pending_len(), 2);
        // Items ahead of the keyless one were applied before the abort.
        assert_eq!(h.store.exporter().network_instance, "mgmt");
    }
}
