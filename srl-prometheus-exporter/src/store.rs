//! In-memory configuration store.
//!
//! Owned by the agent task; nothing else holds a reference to it. Readers get
//! clones.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::catalog::MetricCatalog;
use crate::model::{ExporterConfig, MetricDefinition, MetricKind, NetworkInstanceRecord};
use crate::notification::ConfigNotification;

#[derive(Debug)]
pub struct ConfigStore {
    catalog: Arc<MetricCatalog>,
    exporter: ExporterConfig,
    known: BTreeMap<String, MetricDefinition>,
    custom: BTreeMap<String, MetricDefinition>,
    instances: HashMap<String, NetworkInstanceRecord>,
    pending: Vec<ConfigNotification>,
}

impl ConfigStore {
    /// Empty store: exporter disabled and down, every catalog metric present
    /// but disabled with no paths.
    pub fn new(catalog: Arc<MetricCatalog>) -> Self {
        let known = catalog
            .names()
            .map(|name| {
                (
                    name.to_string(),
                    MetricDefinition::disabled(name, MetricKind::Known),
                )
            })
            .collect();

        Self {
            catalog,
            exporter: ExporterConfig::default(),
            known,
            custom: BTreeMap::new(),
            instances: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<MetricCatalog> {
        &self.catalog
    }

    pub fn exporter(&self) -> &ExporterConfig {
        &self.exporter
    }

    pub fn exporter_mut(&mut self) -> &mut ExporterConfig {
        &mut self.exporter
    }

    /// Replace the exporter config wholesale.
    pub fn set_exporter(&mut self, exporter: ExporterConfig) {
        self.exporter = exporter;
    }

    /// Increment and return the scrape counter.
    pub fn bump_scrape_count(&mut self) -> u64 {
        self.exporter.scrape_count += 1;
        self.exporter.scrape_count
    }

    pub fn known_metrics(&self) -> &BTreeMap<String, MetricDefinition> {
        &self.known
    }

    pub fn custom_metrics(&self) -> &BTreeMap<String, MetricDefinition> {
        &self.custom
    }

    /// Store a metric definition in the mapping for its kind.
    pub fn upsert_metric(&mut self, definition: MetricDefinition) {
        let map = match definition.kind {
            MetricKind::Known => &mut self.known,
            MetricKind::Custom => &mut self.custom,
        };
        map.insert(definition.name.clone(), definition);
    }

    /// Reset a known metric to disabled with no paths. Returns whether it existed.
    pub fn reset_known(&mut self, name: &str) -> bool {
        self.known
            .insert(
                name.to_string(),
                MetricDefinition::disabled(name, MetricKind::Known),
            )
            .is_some()
    }

    /// Remove a custom metric entirely.
    pub fn remove_custom(&mut self, name: &str) -> Option<MetricDefinition> {
        self.custom.remove(name)
    }

    /// Enabled definitions, known metrics first, each group in name order.
    pub fn enabled_metrics(&self) -> Vec<MetricDefinition> {
        self.known
            .values()
            .chain(self.custom.values())
            .filter(|d| d.is_enabled())
            .cloned()
            .collect()
    }

    pub fn upsert_instance(&mut self, record: NetworkInstanceRecord) {
        self.instances.insert(record.name.clone(), record);
    }

    pub fn remove_instance(&mut self, name: &str) -> Option<NetworkInstanceRecord> {
        self.instances.remove(name)
    }

    /// The record of the configured network instance, if known.
    pub fn configured_instance(&self) -> Option<&NetworkInstanceRecord> {
        self.instances.get(&self.exporter.network_instance)
    }

    pub fn push_pending(&mut self, notification: ConfigNotification) {
        self.pending.push(notification);
    }

    /// Take the whole pending transaction, leaving the queue empty.
    pub fn take_pending(&mut self) -> Vec<ConfigNotification> {
        std::mem::take(&mut self.pending)
    }

    /// Put a batch back at the head of the queue.
    pub fn restore_pending(&mut self, mut batch: Vec<ConfigNotification>) {
        batch.append(&mut self.pending);
        self.pending = batch;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
