//! Kubernetes pod-resources back end
//!
//! GPUs are allocated to containers either by a device plugin (device ids
//! are PCI bus addresses) or through dynamic resource claims (device names
//! such as `gpu-0000-03-00-0`). A node uses one mechanism at a time; the
//! first matching allocation latches it for the session until `close()`.

use crate::{Result as SchedulerResult, SchedulerError};
use accel_core::{
    LabelName, LabelSet, Result, SchedulerBackend, SchedulerKind, WorkloadInfo, WorkloadMap,
    WorkloadRecord,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default device-plugin resource name
pub const DEFAULT_RESOURCE_NAME: &str = "amd.com/gpu";

/// Default dynamic-resource driver name
pub const DEFAULT_DRA_DRIVER: &str = "gpu.amd.com";

/// Resources assigned to one pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodResources {
    pub name: String,
    pub namespace: String,
    pub containers: Vec<ContainerResources>,
}

/// Resources assigned to one container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerResources {
    pub name: String,
    pub devices: Vec<ContainerDevices>,
    pub dynamic_resources: Vec<DynamicResource>,
}

/// Device-plugin allocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerDevices {
    pub resource_name: String,
    pub device_ids: Vec<String>,
}

/// Dynamic resource claim allocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicResource {
    pub claim_name: String,
    pub claim_namespace: String,
    pub devices: Vec<ClaimDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimDevice {
    pub driver_name: String,
    pub pool_name: String,
    pub device_name: String,
}

/// Source of kubelet pod resources
#[async_trait]
pub trait PodResourcesSource: Send + Sync {
    async fn list(&self) -> SchedulerResult<Vec<PodResources>>;
}

/// Pod resources read from a JSON document on disk
#[derive(Debug, Clone)]
pub struct FilePodResources {
    path: PathBuf,
}

impl FilePodResources {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PodResourcesSource for FilePodResources {
    async fn list(&self) -> SchedulerResult<Vec<PodResources>> {
        let content = tokio::fs::read(&self.path).await.map_err(|e| {
            SchedulerError::PodResources(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Allocation mechanism in use on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    DevicePlugin,
    DynamicResource,
}

/// Kubernetes back end keyed by PCI bus address
pub struct KubernetesBackend {
    source: Box<dyn PodResourcesSource>,
    resource_name: String,
    dra_driver: String,
    mode: RwLock<Option<AllocationMode>>,
}

impl KubernetesBackend {
    pub fn new(source: Box<dyn PodResourcesSource>) -> Self {
        Self {
            source,
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            dra_driver: DEFAULT_DRA_DRIVER.to_string(),
            mode: RwLock::new(None),
        }
    }

    pub fn with_resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = name.into();
        self
    }

    pub fn with_dra_driver(mut self, driver: impl Into<String>) -> Self {
        self.dra_driver = driver.into();
        self
    }

    /// Latched allocation mechanism, if any allocation has been seen
    pub async fn mode(&self) -> Option<AllocationMode> {
        *self.mode.read().await
    }
}

#[async_trait]
impl SchedulerBackend for KubernetesBackend {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Kubernetes
    }

    async fn list_workloads(&self) -> Result<WorkloadMap> {
        let pods = self.source.list().await?;
        let mut mode = *self.mode.read().await;
        let mut workloads = WorkloadMap::new();

        for pod in &pods {
            for container in &pod.containers {
                let record = || WorkloadRecord {
                    scheduler: SchedulerKind::Kubernetes,
                    info: WorkloadInfo::Pod {
                        pod: pod.name.clone(),
                        namespace: pod.namespace.clone(),
                        container: container.name.clone(),
                    },
                };

                if mode != Some(AllocationMode::DynamicResource) {
                    for devices in container
                        .devices
                        .iter()
                        .filter(|d| d.resource_name == self.resource_name)
                    {
                        for id in &devices.device_ids {
                            mode.get_or_insert(AllocationMode::DevicePlugin);
                            workloads.insert(id.trim().to_ascii_lowercase(), record());
                        }
                    }
                }

                if mode != Some(AllocationMode::DevicePlugin) {
                    for claim in &container.dynamic_resources {
                        for device in claim.devices.iter().filter(|d| d.driver_name == self.dra_driver) {
                            match dra_device_bus_id(&device.device_name) {
                                Some(bus_id) => {
                                    mode.get_or_insert(AllocationMode::DynamicResource);
                                    workloads.insert(bus_id, record());
                                }
                                None => debug!("Skipping claim device {:?}", device.device_name),
                            }
                        }
                    }
                }
            }
        }

        let mut latched = self.mode.write().await;
        if latched.is_none() {
            if let Some(detected) = mode {
                info!("Detected {:?} GPU allocation", detected);
                *latched = Some(detected);
            }
        }
        Ok(workloads)
    }

    fn check_export_labels(&self, labels: &LabelSet) -> bool {
        [LabelName::Pod, LabelName::Namespace, LabelName::Container]
            .into_iter()
            .any(|l| labels.contains(l))
    }

    async fn close(&self) -> Result<()> {
        *self.mode.write().await = None;
        Ok(())
    }
}

/// `gpu-0000-03-00-0` to `0000:03:00.0`
pub fn dra_device_bus_id(device_name: &str) -> Option<String> {
    let (_, address) = device_name.split_once('-')?;
    let parts: Vec<&str> = address.split('-').collect();
    match parts.as_slice() {
        [domain, bus, device, function]
            if [domain, bus, device, function]
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_hexdigit())) =>
        {
            Some(format!("{}:{}:{}.{}", domain, bus, device, function).to_ascii_lowercase())
        }
        _ => None,
    }
}
