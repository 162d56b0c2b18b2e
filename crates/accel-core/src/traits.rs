//! Core traits for the exporter
//!
//! These traits are the seams between the agent coordinator, the device
//! clients, the remote control plane and the workload schedulers.

use crate::config::ExporterConfig;
use crate::devices::{
    CperRecordList, DeviceList, EventList, EventSeverity, NicDeviceList, NicPortList,
    NicStationList,
};
use crate::labels::LabelSet;
use crate::types::{DeviceId, DeviceKind, HealthVerdict, SchedulerKind, WorkloadRecord};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Client of the remote control-plane service.
///
/// Responses carry an application status; implementations return them
/// as-is and leave the status check to the caller.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// List GPUs with spec, status and stats
    async fn get_devices(&self) -> Result<DeviceList>;

    /// List asynchronous events at or above the given severity
    async fn get_events(&self, severity: EventSeverity) -> Result<EventList>;

    /// List vendor error records at or above the given severity
    async fn get_vendor_error_records(&self, severity: EventSeverity) -> Result<CperRecordList>;

    /// List network adapters
    async fn get_nic_devices(&self) -> Result<NicDeviceList>;

    /// List NIC stations
    async fn get_nic_stations(&self) -> Result<NicStationList>;

    /// List NIC ports with counters
    async fn get_nic_ports(&self) -> Result<NicPortList>;

    /// Whether the underlying connection is usable
    fn is_connected(&self) -> bool {
        true
    }

    /// Release the connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Health of one evaluated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub index: u32,
    pub verdict: HealthVerdict,
}

/// Exported health state of a device client, keyed by device id
pub type HealthStates = BTreeMap<DeviceId, DeviceHealth>;

/// Uniform contract implemented by every device-kind client
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Device kind served by this client
    fn kind(&self) -> DeviceKind;

    /// Whether the client is initialised and not closed
    fn is_active(&self) -> bool;

    /// Resolve fields, labels and selector from configuration and register gauges
    async fn init_configs(&self, config: &ExporterConfig) -> Result<()>;

    /// Populate metrics that do not change over the session
    async fn update_static_metrics(&self) -> Result<()>;

    /// Refresh every per-cycle metric
    async fn update_metrics_stats(&self) -> Result<()>;

    /// Run one health evaluation cycle and publish its verdicts
    async fn process_health_validation(&self) -> Result<()>;

    /// Last published verdicts; `None` until an evaluation has completed
    async fn get_health_states(&self) -> Option<HealthStates>;

    /// Operator entry point: inject error counts for a device
    async fn set_error(&self, id: &DeviceId, fields: &[String], counts: &[u64]) -> Result<()>;

    /// Operator entry point: force or clear a verdict
    async fn set_health_override(&self, id: &DeviceId, verdict: &str) -> Result<()>;

    /// Unregister gauges and release resources
    async fn close(&self) -> Result<()>;
}

/// Workloads keyed by the back end's own device key space
pub type WorkloadMap = BTreeMap<String, WorkloadRecord>;

/// Pluggable workload scheduler back end
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Current device-to-workload assignments
    async fn list_workloads(&self) -> Result<WorkloadMap>;

    /// Whether any of the enabled labels is fed by this back end
    fn check_export_labels(&self, labels: &LabelSet) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Publishes device health as node labels
#[async_trait]
pub trait NodeLabeller: Send + Sync {
    /// Replace the labels owned by one device kind
    async fn publish(&self, kind: DeviceKind, labels: BTreeMap<String, String>) -> Result<()>;
}
