//! Labeled gauge sets
//!
//! A device client owns one [`FieldGauges`] per label layout. Each enabled
//! field becomes a `GaugeVec` named after the lower-cased field name. The
//! set is registered on construction and unregistered on close, so a client
//! that is torn down and recreated starts from a clean registry.
//!
//! Per-device values are published through a [`SeriesBatch`]. Series are
//! overwritten in place and only the ones missing from the new batch are
//! removed afterwards, so a scrape never observes a half-empty family.

use crate::{MetricsError, Result};
use prometheus::core::Collector;
use prometheus::{GaugeVec, Opts, Registry};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Field name plus label values of one exported series
type SeriesKey = (String, Vec<String>);

/// Name and help text of one gauge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeSpec {
    pub field: String,
    pub help: String,
}

impl GaugeSpec {
    pub fn new(field: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            help: help.into(),
        }
    }

    /// Exported metric name
    pub fn metric_name(&self) -> String {
        self.field.to_ascii_lowercase()
    }
}

/// Gauges sharing one label layout, keyed by field name
#[derive(Debug)]
pub struct FieldGauges {
    registry: Registry,
    label_names: Vec<String>,
    gauges: BTreeMap<String, GaugeVec>,
    published: Mutex<BTreeSet<SeriesKey>>,
}

impl FieldGauges {
    /// Create and register one gauge per spec
    pub fn register(registry: &Registry, specs: &[GaugeSpec], label_names: Vec<String>) -> Result<Self> {
        let names: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let mut gauges = BTreeMap::new();

        for spec in specs {
            let gauge = GaugeVec::new(Opts::new(spec.metric_name(), spec.help.clone()), &names)?;
            if let Err(e) = registry.register(Box::new(gauge.clone())) {
                // Roll back what this set already registered
                for registered in gauges.values() {
                    let _ = registry.unregister(Box::new(GaugeVec::clone(registered)));
                }
                return Err(MetricsError::Registry(format!(
                    "failed to register {}: {}",
                    spec.metric_name(),
                    e
                )));
            }
            gauges.insert(spec.field.to_ascii_uppercase(), gauge);
        }

        debug!("Registered {} gauges", gauges.len());
        Ok(Self {
            registry: registry.clone(),
            label_names,
            gauges,
            published: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn contains(&self, field: &str) -> bool {
        self.gauges.contains_key(&field.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.gauges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty()
    }

    fn label_values(&self, labels: &BTreeMap<String, String>) -> Vec<String> {
        self.label_names
            .iter()
            .map(|name| labels.get(name).cloned().unwrap_or_default())
            .collect()
    }

    /// Set one gauge value.
    ///
    /// Disabled fields are ignored. Labels missing from `labels` are exported
    /// empty; extra entries are ignored. Returns the series key when written.
    pub fn set(&self, field: &str, labels: &BTreeMap<String, String>, value: f64) -> Option<(String, Vec<String>)> {
        let field = field.to_ascii_uppercase();
        let gauge = self.gauges.get(&field)?;
        let values = self.label_values(labels);
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        match gauge.get_metric_with_label_values(&refs) {
            Ok(metric) => {
                metric.set(value);
                Some((field, values))
            }
            Err(e) => {
                warn!("Failed to set {}: {}", field, e);
                None
            }
        }
    }

    /// Start a complete replacement of the per-device series
    pub fn batch(&self) -> SeriesBatch<'_> {
        SeriesBatch {
            gauges: self,
            written: BTreeSet::new(),
        }
    }

    /// Current value of one series, if present. Never creates the series.
    pub fn get(&self, field: &str, labels: &BTreeMap<String, String>) -> Option<f64> {
        let gauge = self.gauges.get(&field.to_ascii_uppercase())?;
        let wanted: BTreeMap<&str, String> = self
            .label_names
            .iter()
            .map(String::as_str)
            .zip(self.label_values(labels))
            .collect();
        let families = gauge.collect();
        let value = families
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                metric
                    .get_label()
                    .iter()
                    .all(|pair| wanted.get(pair.get_name()).map(String::as_str) == Some(pair.get_value()))
            })
            .map(|metric| metric.get_gauge().get_value());
        value
    }

    /// Remove every gauge of this set from the registry
    pub fn unregister(&self) {
        for (field, gauge) in &self.gauges {
            if let Err(e) = self.registry.unregister(Box::new(gauge.clone())) {
                debug!("Gauge {} was not registered: {}", field, e);
            }
        }
    }
}

/// One round of per-device values; series not written are removed on commit
pub struct SeriesBatch<'a> {
    gauges: &'a FieldGauges,
    written: BTreeSet<SeriesKey>,
}

impl SeriesBatch<'_> {
    pub fn set(&mut self, field: &str, labels: &BTreeMap<String, String>, value: f64) {
        if let Some(key) = self.gauges.set(field, labels, value) {
            self.written.insert(key);
        }
    }

    pub fn len(&self) -> usize {
        self.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    /// Remove series published by the previous commit and absent from this
    /// one. Returns the number removed.
    pub async fn commit(self) -> usize {
        let mut published = self.gauges.published.lock().await;
        let mut removed = 0;
        for (field, values) in published.difference(&self.written) {
            let Some(gauge) = self.gauges.gauges.get(field) else {
                continue;
            };
            let refs: Vec<&str> = values.iter().map(String::as_str).collect();
            match gauge.remove_label_values(&refs) {
                Ok(()) => removed += 1,
                Err(e) => debug!("Series of {} already gone: {}", field, e),
            }
        }
        if removed > 0 {
            debug!("Removed {} departed series", removed);
        }
        *published = self.written;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(gpu: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("gpu_id".to_string(), gpu.to_string());
        labels.insert("unused".to_string(), "x".to_string());
        labels
    }

    #[test]
    fn test_register_and_set() {
        let registry = Registry::new();
        let specs = vec![
            GaugeSpec::new("GPU_PACKAGE_POWER", "Package power in watts"),
            GaugeSpec::new("GPU_EDGE_TEMPERATURE", "Edge temperature in celsius"),
        ];
        let gauges = FieldGauges::register(
            &registry,
            &specs,
            vec!["gpu_id".to_string(), "hostname".to_string()],
        )
        .unwrap();
        assert_eq!(gauges.len(), 2);

        gauges.set("gpu_package_power", &labels("0"), 350.0);
        gauges.set("GPU_UNKNOWN_FIELD", &labels("0"), 1.0);
        assert_eq!(gauges.get("GPU_PACKAGE_POWER", &labels("0")), Some(350.0));

        let families = registry.gather();
        let power = families
            .iter()
            .find(|f| f.get_name() == "gpu_package_power")
            .unwrap();
        let metric = &power.get_metric()[0];
        let hostname = metric
            .get_label()
            .iter()
            .find(|l| l.get_name() == "hostname")
            .unwrap();
        assert_eq!(hostname.get_value(), "");
    }

    #[test]
    fn test_unregister_allows_reregistration() {
        let registry = Registry::new();
        let specs = vec![GaugeSpec::new("GPU_HEALTH", "Health")];
        let gauges = FieldGauges::register(&registry, &specs, vec!["gpu_id".to_string()]).unwrap();

        assert!(FieldGauges::register(&registry, &specs, vec!["gpu_id".to_string()]).is_err());

        gauges.unregister();
        assert!(FieldGauges::register(&registry, &specs, vec!["gpu_id".to_string()]).is_ok());
    }

    fn series(registry: &Registry) -> usize {
        registry.gather().iter().map(|f| f.get_metric().len()).sum()
    }

    #[tokio::test]
    async fn test_batch_replaces_series_in_place() {
        let registry = Registry::new();
        let specs = vec![
            GaugeSpec::new("GPU_HEALTH", "Health"),
            GaugeSpec::new("GPU_PACKAGE_POWER", "Package power in watts"),
        ];
        let gauges = FieldGauges::register(&registry, &specs, vec!["gpu_id".to_string()]).unwrap();

        let mut batch = gauges.batch();
        for gpu in ["0", "1"] {
            batch.set("GPU_HEALTH", &labels(gpu), 1.0);
            batch.set("GPU_PACKAGE_POWER", &labels(gpu), 300.0);
        }
        batch.set("GPU_UNKNOWN_FIELD", &labels("0"), 1.0);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.commit().await, 0);
        assert_eq!(series(&registry), 4);

        // Mid-round a scrape still sees every series of the previous round
        let mut batch = gauges.batch();
        batch.set("GPU_HEALTH", &labels("0"), 0.0);
        assert_eq!(series(&registry), 4);
        assert_eq!(gauges.get("GPU_HEALTH", &labels("0")), Some(0.0));
        batch.set("GPU_PACKAGE_POWER", &labels("0"), 310.0);

        // GPU 1 departed
        assert_eq!(batch.commit().await, 2);
        assert_eq!(series(&registry), 2);
        assert_eq!(gauges.get("GPU_PACKAGE_POWER", &labels("0")), Some(310.0));
        assert_eq!(gauges.get("GPU_HEALTH", &labels("1")), None);
    }

    #[tokio::test]
    async fn test_empty_batch_clears_published_series() {
        let registry = Registry::new();
        let specs = vec![GaugeSpec::new("GPU_HEALTH", "Health")];
        let gauges = FieldGauges::register(&registry, &specs, vec!["gpu_id".to_string()]).unwrap();

        let mut batch = gauges.batch();
        batch.set("GPU_HEALTH", &labels("1"), 1.0);
        batch.commit().await;
        assert_eq!(series(&registry), 1);

        assert!(gauges.batch().is_empty());
        assert_eq!(gauges.batch().commit().await, 1);
        assert_eq!(series(&registry), 0);
    }
}
