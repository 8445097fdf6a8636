//! OpenMetrics text rendering of one scrape's samples.
//!
//! A fresh registry is built per scrape, so series that disappear from the
//! device disappear from the exposition as well.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::mapping::Sample;

/// Content type of [`render`]'s output.
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

type SampleFamily = Family<Vec<(String, String)>, Gauge<f64, AtomicU64>>;

/// Render samples grouped into one gauge family per name.
///
/// When the same name and label set occur twice the last value wins.
pub fn render(samples: &[Sample]) -> Result<String, std::fmt::Error> {
    let mut registry = Registry::default();
    let mut families: BTreeMap<&str, SampleFamily> = BTreeMap::new();

    for sample in samples {
        let family = families.entry(sample.name.as_str()).or_insert_with(|| {
            let family = SampleFamily::default();
            registry.register(sample.name.clone(), sample.help.clone(), family.clone());
            family
        });
        family.get_or_create(&sample.labels).set(sample.value);
    }

    let mut body = String::new();
    encode(&mut body, &registry)?;
    Ok(body)
}
