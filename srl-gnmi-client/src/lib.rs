//! gNMI (gRPC Network Management Interface) client for the SR Linux
//! Prometheus exporter.
//!
//! Talks to the node-local gNMI server, usually over its unix socket, and
//! supports the two calls the agent needs: a one-shot `Subscribe` (mode
//! ONCE) that yields [`srl_exporter_common::TelemetryEvent`]s, and `Get`.

pub mod client;
pub mod config;
pub mod event;
pub mod path;
pub mod proto;

pub use client::{EventStream, GnmiClient, GnmiError};
pub use config::{Credentials, GnmiConfig};
pub use event::{notification_to_events, typed_value_to_string};
pub use path::{parse_path, path_to_xpath};
pub use proto::{DataType, Encoding, Notification};
