//! Prometheus exporter agent for SR Linux.
//!
//! The agent follows the exporter configuration pushed by the management
//! plane, serves a metrics endpoint inside the configured network instance,
//! and optionally registers that endpoint in a Consul service registry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌───────────────────────────────┐     ┌────────────────┐
//! │ Management plane │────>│            Agent              │────>│  gNMI server   │
//! │  (stdio relay)   │<────│ store, transactions, lifecycle│     │ (per scrape)   │
//! └──────────────────┘     └───────────────────────────────┘     └────────────────┘
//!                              │                     │
//!                              v                     v
//!                     ┌─────────────────┐   ┌─────────────────┐
//!                     │   HTTP server   │   │  Registration   │
//!                     │ (in namespace)  │   │  loop (Consul)  │
//!                     └─────────────────┘   └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! srl-prometheus-exporter --config metrics.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::AgentConfig`] for the agent's file configuration. The
//! exporter itself is configured through the management plane.

pub mod agent;
pub mod catalog;
pub mod collector;
pub mod config;
pub mod exposition;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod mapping;
pub mod model;
pub mod netns;
pub mod notification;
pub mod publish;
pub mod registration;
pub mod registry;
pub mod relay;
pub mod server;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod transaction;

pub use agent::{Agent, AgentError, AgentHandle, AgentStatus};
pub use catalog::MetricCatalog;
pub use collector::{CollectionEngine, ScrapeReport};
pub use config::AgentConfig;
pub use identity::{GnmiIdentitySource, IdentitySource, SystemIdentity};
pub use lifecycle::LifecycleDeps;
pub use netns::{HostResolver, NamespaceResolver, NetnsResolver};
pub use publish::{StateMirror, StatePublisher};
pub use registry::{ConsulConnector, RegistryConnector};
pub use relay::{JsonLinesPublisher, run_feed};
pub use source::TelemetrySource;
