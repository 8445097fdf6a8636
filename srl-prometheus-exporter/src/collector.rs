//! Scrape-time collection: one concurrent fetch per enabled metric.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use srl_gnmi_client::{Credentials, GnmiError};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::mapping::{DEFAULT_HELP, Sample, event_samples};
use crate::model::MetricKind;
use crate::publish::StateMirror;
use crate::source::TelemetrySource;
use crate::store::ConfigStore;

/// Why one metric contributed no samples to a scrape.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("metric has no telemetry paths")]
    NoPaths,
    #[error("telemetry fetch failed: {0}")]
    Source(#[from] GnmiError),
    #[error("telemetry fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of one scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeReport {
    pub scrape_count: u64,
    pub samples: Vec<Sample>,
    /// Number of metrics whose fetch failed.
    pub failures: usize,
}

/// Fetch plan for one metric, detached from the store.
struct FetchJob {
    name: String,
    help: String,
    paths: Vec<String>,
}

pub struct CollectionEngine {
    source: Arc<dyn TelemetrySource>,
    credentials: Option<Credentials>,
    fetch_timeout: Duration,
}

impl CollectionEngine {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        credentials: Option<Credentials>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            credentials,
            fetch_timeout,
        }
    }

    /// Run one scrape against the store.
    ///
    /// The counter is bumped and mirrored before any fetch starts, so it
    /// advances even when every fetch fails. Known metrics take their paths
    /// from the catalog at fetch time, custom metrics use their stored paths.
    pub async fn collect(&self, store: &mut ConfigStore, mirror: &StateMirror) -> ScrapeReport {
        let scrape_count = store.bump_scrape_count();
        mirror.exporter(store.exporter()).await;

        let jobs: Vec<FetchJob> = store
            .enabled_metrics()
            .into_iter()
            .map(|definition| {
                let paths = match definition.kind {
                    MetricKind::Known => store.catalog().paths(&definition.name).to_vec(),
                    MetricKind::Custom => definition.spec.paths,
                };
                let help = if definition.spec.help_text.is_empty() {
                    DEFAULT_HELP.to_string()
                } else {
                    definition.spec.help_text
                };
                FetchJob {
                    name: definition.name,
                    help,
                    paths,
                }
            })
            .collect();

        debug!(scrape = scrape_count, metrics = jobs.len(), "Starting scrape");

        let mut tasks = JoinSet::new();
        for job in jobs {
            let source = Arc::clone(&self.source);
            let credentials = self.credentials.clone();
            let timeout = self.fetch_timeout;
            tasks.spawn(async move {
                let result = fetch(source.as_ref(), &job, credentials.as_ref(), timeout).await;
                (job.name, result)
            });
        }

        let mut samples = Vec::new();
        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(mut metric_samples))) => samples.append(&mut metric_samples),
                Ok((name, Err(e))) => {
                    failures += 1;
                    warn!(metric = %name, error = %e, "Metric fetch failed");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, "Metric fetch task panicked");
                }
            }
        }

        // Join order is completion order; sort for a stable exposition.
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));

        debug!(
            scrape = scrape_count,
            samples = samples.len(),
            failures,
            "Scrape complete"
        );

        ScrapeReport {
            scrape_count,
            samples,
            failures,
        }
    }
}

async fn fetch(
    source: &dyn TelemetrySource,
    job: &FetchJob,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> Result<Vec<Sample>, FetchError> {
    if job.paths.is_empty() {
        return Err(FetchError::NoPaths);
    }

    let work = async {
        let mut stream = source.subscribe_once(&job.paths, credentials).await?;
        let mut samples = Vec::new();
        while let Some(event) = stream.next().await {
            samples.extend(event_samples(&job.name, &job.help, &event?));
        }
        Ok::<_, FetchError>(samples)
    };

    tokio::time::timeout(timeout, work)
        .await
        .map_err(|_| FetchError::Timeout(timeout))?
}
