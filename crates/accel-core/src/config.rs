//! Exporter configuration surface
//!
//! Loading and watching the configuration file is the agent's job; device
//! clients only ever read an [`ExporterConfig`].

use crate::labels::{LabelName, LabelSet};
use crate::selector::DeviceSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read-only configuration consumed by the device clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Node name reported in the `hostname` label
    pub hostname: String,

    /// GPU exporter settings
    pub gpu: GpuConfig,

    /// NIC exporter settings
    pub nic: NicConfig,

    /// Operator-defined static labels
    pub custom_labels: BTreeMap<String, String>,

    /// Attribute GPUs to Kubernetes pods
    pub kubernetes_enabled: bool,

    /// Attribute GPUs to Slurm jobs
    pub slurm_enabled: bool,
}

/// GPU exporter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub enabled: bool,

    /// Device index selector, e.g. `"0-3,7"`; empty selects every GPU
    pub selector: String,

    /// Enabled field names; empty enables every field
    pub fields: Vec<String>,

    /// Enabled label names on top of the mandatory ones
    pub labels: Vec<String>,

    /// Merge profiler-sourced fields into the export
    pub profiler_enabled: bool,
}

/// NIC exporter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicConfig {
    pub enabled: bool,

    /// Enabled field names; empty enables every field
    pub fields: Vec<String>,

    /// Enabled label names on top of the mandatory ones
    pub labels: Vec<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            hostname: std::env::var("NODE_NAME").unwrap_or_else(|_| "localhost".to_string()),
            gpu: GpuConfig::default(),
            nic: NicConfig::default(),
            custom_labels: BTreeMap::new(),
            kubernetes_enabled: false,
            slurm_enabled: false,
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            selector: String::new(),
            fields: Vec::new(),
            labels: Vec::new(),
            profiler_enabled: false,
        }
    }
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fields: Vec::new(),
            labels: Vec::new(),
        }
    }
}

impl ExporterConfig {
    /// Resolved GPU label set
    pub fn gpu_labels(&self) -> LabelSet {
        LabelSet::resolve(&LabelName::GPU_MANDATORY, &self.gpu.labels, &self.custom_labels)
    }

    /// Resolved NIC label set
    pub fn nic_labels(&self) -> LabelSet {
        LabelSet::resolve(&LabelName::NIC_MANDATORY, &self.nic.labels, &self.custom_labels)
    }

    /// GPU selector; invalid syntax selects every GPU
    pub fn gpu_selector(&self) -> DeviceSelector {
        DeviceSelector::parse_or_all(&self.gpu.selector)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }
        if !self.gpu.enabled && !self.nic.enabled {
            return Err("at least one of gpu or nic monitoring must be enabled".to_string());
        }
        Ok(())
    }
}
