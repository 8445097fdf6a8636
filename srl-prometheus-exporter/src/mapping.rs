//! Mapping from telemetry events to Prometheus samples.

use std::collections::HashSet;

use srl_exporter_common::TelemetryEvent;

/// Help text used when a metric definition has none.
pub const DEFAULT_HELP: &str = "SRLinux generated metric";

/// One numeric sample ready for exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Replace every run of characters outside `[A-Za-z0-9_]` with one `_`.
///
/// Existing underscores are kept as they are.
pub fn sanitize(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut in_invalid_run = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            result.push(c);
            in_invalid_run = false;
        } else if !in_invalid_run {
            result.push('_');
            in_invalid_run = true;
        }
    }

    result
}

/// Last element of a slash-separated path, ignoring trailing slashes.
///
/// Mirrors the usual path-base rules: `""` gives `"."` and a path made of
/// slashes only gives `"/"`.
pub fn base_name(path: &str) -> &str {
    if path.is_empty() {
        return ".";
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Sample name for a value of `metric`: sanitized `<metric>_<base(value)>`
/// without leading underscores.
pub fn sample_name(metric: &str, value_name: &str) -> String {
    let name = sanitize(&format!("{}_{}", metric, base_name(value_name)));
    name.trim_start_matches('_').to_string()
}

/// Label set from an event's tags; the first tag wins when two tag keys
/// sanitize to the same label name.
pub fn label_set(event: &TelemetryEvent) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut labels = Vec::with_capacity(event.tags.len());

    for (key, value) in &event.tags {
        let label = sanitize(base_name(key));
        if seen.insert(label.clone()) {
            labels.push((label, value.clone()));
        }
    }

    labels
}

/// One sample per value of `event` that coerces to a float.
pub fn event_samples(metric: &str, help: &str, event: &TelemetryEvent) -> Vec<Sample> {
    let labels = label_set(event);

    event
        .values
        .iter()
        .filter_map(|(value_name, value)| {
            let value = value.as_f64()?;
            Some(Sample {
                name: sample_name(metric, value_name),
                help: help.to_string(),
                labels: labels.clone(),
                value,
            })
        })
        .collect()
}
