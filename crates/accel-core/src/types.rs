//! Common identifiers and verdict types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, stable identifier of one physical device.
///
/// Derived from the binary device UUID reported by the control plane and
/// rendered in hyphenated form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an id from an already-rendered string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id from the raw 16-byte device UUID.
    ///
    /// Byte slices of any other length fall back to lowercase hex so that
    /// malformed UUIDs still produce a stable key.
    pub fn from_uuid_bytes(bytes: &[u8]) -> Self {
        match Uuid::from_slice(bytes) {
            Ok(uuid) => Self(uuid.hyphenated().to_string()),
            Err(_) => Self(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-device health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthVerdict {
    /// Parse an operator-supplied verdict.
    ///
    /// Only `healthy` and `unhealthy` are recognized; anything else
    /// (including `unknown`) yields `None`.
    pub fn parse_override(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthy" => Some(HealthVerdict::Healthy),
            "unhealthy" => Some(HealthVerdict::Unhealthy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthVerdict::Healthy => "healthy",
            HealthVerdict::Unhealthy => "unhealthy",
            HealthVerdict::Unknown => "unknown",
        }
    }

    /// Gauge value exported for this verdict
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthVerdict::Healthy => 1.0,
            _ => 0.0,
        }
    }
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of device handled by a device client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Gpu,
    Nic,
}

impl DeviceKind {
    /// Whether devices of this kind carry a health verdict
    pub fn is_health_aware(&self) -> bool {
        matches!(self, DeviceKind::Gpu)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Gpu => "gpu",
            DeviceKind::Nic => "nic",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload scheduler that attributed a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Kubernetes,
    Slurm,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Kubernetes => write!(f, "kubernetes"),
            SchedulerKind::Slurm => write!(f, "slurm"),
        }
    }
}

/// Workload details as reported by the scheduler that owns them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkloadInfo {
    Pod {
        pod: String,
        namespace: String,
        container: String,
    },
    Job {
        job_id: String,
        user: String,
        partition: String,
        cluster: String,
    },
}

/// Workload currently using one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub scheduler: SchedulerKind,
    pub info: WorkloadInfo,
}

impl WorkloadRecord {
    /// Label key/value pairs contributed by this workload
    pub fn labels(&self) -> Vec<(&'static str, String)> {
        match &self.info {
            WorkloadInfo::Pod {
                pod,
                namespace,
                container,
            } => vec![
                ("pod", pod.clone()),
                ("namespace", namespace.clone()),
                ("container", container.clone()),
            ],
            WorkloadInfo::Job {
                job_id,
                user,
                partition,
                cluster,
            } => vec![
                ("job_id", job_id.clone()),
                ("job_user", user.clone()),
                ("job_partition", partition.clone()),
                ("cluster_name", cluster.clone()),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_from_uuid_bytes() {
        let bytes = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ];
        let id = DeviceId::from_uuid_bytes(&bytes);
        assert_eq!(id.as_str(), "01020304-0506-0708-090a-0b0c0d0e0f10");

        let short = DeviceId::from_uuid_bytes(&[0xab, 0xcd]);
        assert_eq!(short.as_str(), "abcd");
    }

    #[test]
    fn test_override_parsing() {
        assert_eq!(HealthVerdict::parse_override("healthy"), Some(HealthVerdict::Healthy));
        assert_eq!(HealthVerdict::parse_override(" Unhealthy "), Some(HealthVerdict::Unhealthy));
        assert_eq!(HealthVerdict::parse_override("unknown"), None);
        assert_eq!(HealthVerdict::parse_override(""), None);
    }

    #[test]
    fn test_device_kind_health_awareness() {
        assert!(DeviceKind::Gpu.is_health_aware());
        assert!(!DeviceKind::Nic.is_health_aware());
    }

    #[test]
    fn test_workload_labels() {
        let record = WorkloadRecord {
            scheduler: SchedulerKind::Slurm,
            info: WorkloadInfo::Job {
                job_id: "42".to_string(),
                user: "alice".to_string(),
                partition: "gpu".to_string(),
                cluster: "c1".to_string(),
            },
        };
        let labels = record.labels();
        assert!(labels.contains(&("job_id", "42".to_string())));
        assert!(labels.contains(&("job_user", "alice".to_string())));
    }
}
