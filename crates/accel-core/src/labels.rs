//! Label catalogue for exported metrics
//!
//! Every exported gauge carries a label set drawn from a fixed superset,
//! filtered down to what the operator enabled, plus custom static labels.
//! The resolved set is owned by each device client; there is no
//! process-wide label state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// Maximum number of operator-defined static labels
pub const MAX_CUSTOM_LABELS: usize = 10;

/// Catalogue of known label names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelName {
    GpuId,
    GpuUuid,
    SerialNumber,
    CardModel,
    CardVendor,
    DriverVersion,
    VbiosVersion,
    Hostname,
    GpuPartitionId,
    GpuComputePartitionType,
    GpuMemoryPartitionType,
    Pod,
    Namespace,
    Container,
    JobId,
    JobUser,
    JobPartition,
    ClusterName,
    NicId,
    NicSerialNumber,
    NicStationName,
    NicPortName,
}

impl LabelName {
    pub const ALL: [LabelName; 22] = [
        LabelName::GpuId,
        LabelName::GpuUuid,
        LabelName::SerialNumber,
        LabelName::CardModel,
        LabelName::CardVendor,
        LabelName::DriverVersion,
        LabelName::VbiosVersion,
        LabelName::Hostname,
        LabelName::GpuPartitionId,
        LabelName::GpuComputePartitionType,
        LabelName::GpuMemoryPartitionType,
        LabelName::Pod,
        LabelName::Namespace,
        LabelName::Container,
        LabelName::JobId,
        LabelName::JobUser,
        LabelName::JobPartition,
        LabelName::ClusterName,
        LabelName::NicId,
        LabelName::NicSerialNumber,
        LabelName::NicStationName,
        LabelName::NicPortName,
    ];

    /// Labels carried by every GPU gauge regardless of configuration
    pub const GPU_MANDATORY: [LabelName; 4] = [
        LabelName::GpuId,
        LabelName::SerialNumber,
        LabelName::CardModel,
        LabelName::Hostname,
    ];

    /// Labels carried by every NIC gauge regardless of configuration
    pub const NIC_MANDATORY: [LabelName; 4] = [
        LabelName::NicId,
        LabelName::NicSerialNumber,
        LabelName::NicPortName,
        LabelName::Hostname,
    ];

    /// Labels whose values come from a workload scheduler
    pub const WORKLOAD: [LabelName; 7] = [
        LabelName::Pod,
        LabelName::Namespace,
        LabelName::Container,
        LabelName::JobId,
        LabelName::JobUser,
        LabelName::JobPartition,
        LabelName::ClusterName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelName::GpuId => "gpu_id",
            LabelName::GpuUuid => "gpu_uuid",
            LabelName::SerialNumber => "serial_number",
            LabelName::CardModel => "card_model",
            LabelName::CardVendor => "card_vendor",
            LabelName::DriverVersion => "driver_version",
            LabelName::VbiosVersion => "vbios_version",
            LabelName::Hostname => "hostname",
            LabelName::GpuPartitionId => "gpu_partition_id",
            LabelName::GpuComputePartitionType => "gpu_compute_partition_type",
            LabelName::GpuMemoryPartitionType => "gpu_memory_partition_type",
            LabelName::Pod => "pod",
            LabelName::Namespace => "namespace",
            LabelName::Container => "container",
            LabelName::JobId => "job_id",
            LabelName::JobUser => "job_user",
            LabelName::JobPartition => "job_partition",
            LabelName::ClusterName => "cluster_name",
            LabelName::NicId => "nic_id",
            LabelName::NicSerialNumber => "nic_serial_number",
            LabelName::NicStationName => "nic_station_name",
            LabelName::NicPortName => "nic_port_name",
        }
    }

    /// Case-insensitive lookup by exported name
    pub fn from_name(name: &str) -> Option<LabelName> {
        let lower = name.trim().to_ascii_lowercase();
        LabelName::ALL.into_iter().find(|l| l.as_str() == lower)
    }

    pub fn is_workload(&self) -> bool {
        LabelName::WORKLOAD.contains(self)
    }
}

impl fmt::Display for LabelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved label configuration of one device client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSet {
    enabled: BTreeSet<LabelName>,
    custom: BTreeMap<String, String>,
}

impl LabelSet {
    /// Resolve the enabled label names and custom labels.
    ///
    /// Unknown label names are ignored with a warning. Custom labels that
    /// collide with a catalogue label, or exceed [`MAX_CUSTOM_LABELS`], are
    /// dropped with a warning.
    pub fn resolve(
        mandatory: &[LabelName],
        enabled_names: &[String],
        custom: &BTreeMap<String, String>,
    ) -> Self {
        let mut enabled: BTreeSet<LabelName> = mandatory.iter().copied().collect();
        for name in enabled_names {
            match LabelName::from_name(name) {
                Some(label) => {
                    enabled.insert(label);
                }
                None => warn!("Ignoring unknown label {:?}", name),
            }
        }

        let mut resolved_custom = BTreeMap::new();
        for (key, value) in custom {
            let key = key.trim().to_ascii_lowercase();
            if !is_valid_label_name(&key) {
                warn!("Custom label {:?} is not a valid label name, dropping", key);
                continue;
            }
            if LabelName::from_name(&key).is_some() {
                warn!("Custom label {:?} collides with a built-in label, dropping", key);
                continue;
            }
            if resolved_custom.len() >= MAX_CUSTOM_LABELS {
                warn!(
                    "Custom label {:?} exceeds the limit of {} custom labels, dropping",
                    key, MAX_CUSTOM_LABELS
                );
                continue;
            }
            resolved_custom.insert(key, value.clone());
        }

        Self {
            enabled,
            custom: resolved_custom,
        }
    }

    pub fn contains(&self, label: LabelName) -> bool {
        self.enabled.contains(&label)
    }

    pub fn enabled(&self) -> impl Iterator<Item = LabelName> + '_ {
        self.enabled.iter().copied()
    }

    pub fn custom(&self) -> &BTreeMap<String, String> {
        &self.custom
    }

    /// Whether any workload-identity label is enabled
    pub fn wants_workload(&self) -> bool {
        self.enabled.iter().any(|l| l.is_workload())
    }

    /// Ordered label names used when registering gauges
    pub fn names(&self) -> Vec<String> {
        self.enabled
            .iter()
            .map(|l| l.as_str().to_string())
            .chain(self.custom.keys().cloned())
            .collect()
    }
}

/// `[a-z_][a-z0-9_]*`, excluding the reserved `__` prefix
fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    !name.starts_with("__") && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_labels_always_enabled() {
        let set = LabelSet::resolve(&LabelName::GPU_MANDATORY, &[], &BTreeMap::new());
        for label in LabelName::GPU_MANDATORY {
            assert!(set.contains(label));
        }
        assert!(!set.contains(LabelName::Pod));
        assert!(!set.wants_workload());
    }

    #[test]
    fn test_enabled_names_are_case_insensitive() {
        let set = LabelSet::resolve(
            &LabelName::GPU_MANDATORY,
            &["POD".to_string(), "job_id".to_string(), "bogus".to_string()],
            &BTreeMap::new(),
        );
        assert!(set.contains(LabelName::Pod));
        assert!(set.contains(LabelName::JobId));
        assert!(set.wants_workload());
    }

    #[test]
    fn test_custom_labels_capped_and_deduplicated() {
        let mut custom = BTreeMap::new();
        custom.insert("hostname".to_string(), "shadow".to_string());
        custom.insert("9lives".to_string(), "bad".to_string());
        for i in 0..15 {
            custom.insert(format!("site_{:02}", i), "x".to_string());
        }
        let set = LabelSet::resolve(&LabelName::GPU_MANDATORY, &[], &custom);
        assert_eq!(set.custom().len(), MAX_CUSTOM_LABELS);
        assert!(!set.custom().contains_key("hostname"));
        assert!(!set.custom().contains_key("9lives"));

        let names = set.names();
        assert_eq!(names.len(), LabelName::GPU_MANDATORY.len() + MAX_CUSTOM_LABELS);
    }
}
