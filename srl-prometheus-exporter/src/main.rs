//! SR Linux Prometheus exporter agent.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use srl_exporter_common::init_tracing;
use srl_gnmi_client::GnmiClient;
use srl_prometheus_exporter::{
    Agent, AgentConfig, CollectionEngine, ConsulConnector, GnmiIdentitySource, HostResolver,
    JsonLinesPublisher, LifecycleDeps, MetricCatalog, NamespaceResolver, NetnsResolver,
    StateMirror, run_feed,
};

const DEFAULT_CONFIG: &str = "metrics.json5";

/// Prometheus exporter agent for SR Linux.
#[derive(Parser, Debug)]
#[command(name = "srl-prometheus-exporter")]
#[command(about = "Serve SR Linux telemetry as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format). Defaults to ./metrics.json5 if present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

fn load_config(args: &Args) -> anyhow::Result<AgentConfig> {
    match &args.config {
        Some(path) => AgentConfig::load_from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e)),
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG);
            if path.exists() {
                AgentConfig::load_from_file(&path)
                    .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))
            } else {
                Ok(AgentConfig::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let mut logging = config.logging.clone();
    if args.debug {
        logging.level = "debug".to_string();
    }
    init_tracing(&logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        gnmi = %config.gnmi.address,
        "Starting SR Linux Prometheus exporter"
    );

    let catalog = Arc::new(MetricCatalog::with_overrides(&config.metrics));
    info!(metrics = catalog.len(), "Metric catalog loaded");
    let credentials = config.credentials();
    let timers = config.timers.clone();

    let client = Arc::new(GnmiClient::connect_lazy(&config.gnmi)?);

    let resolver: Arc<dyn NamespaceResolver> = if config.netns.enabled {
        Arc::new(NetnsResolver::new(&config.netns.run_dir))
    } else {
        warn!("Namespace switching disabled, serving in the agent's own namespace");
        Arc::new(HostResolver)
    };

    let publisher = Arc::new(JsonLinesPublisher::new(tokio::io::stdout()));
    let deps = LifecycleDeps {
        resolver,
        connector: Arc::new(ConsulConnector::new(timers.registry_timeout())),
        identity: Arc::new(GnmiIdentitySource::new(
            Arc::clone(&client),
            credentials.clone(),
            timers.telemetry_timeout(),
        )),
        mirror: StateMirror::new(publisher, timers.telemetry_timeout()),
        timers: timers.clone(),
    };
    let engine = CollectionEngine::new(client, credentials, timers.fetch_timeout());

    let (agent, task) = Agent::spawn(catalog, engine, deps);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let feed = run_feed(tokio::io::stdin(), agent.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = feed => {
            match result {
                Ok(()) => info!("Management feed ended, shutting down..."),
                Err(e) => warn!(error = %e, "Management feed failed, shutting down..."),
            }
        }
    }

    if agent.shutdown().await.is_err() {
        warn!("Agent already stopped");
    }
    task.await?;

    info!("Exporter stopped");
    Ok(())
}
