//! GPU device client
//!
//! Reads devices, events and vendor error records through shared snapshot
//! caches, filters out partition devices, fuses health, merges profiler
//! counters and workload attribution, and publishes labeled gauges.

use crate::cper::latest_per_device;
use crate::fields::{self, GPU_NODES_TOTAL};
use crate::health::{evaluate, SharedHealth};
use crate::partition::split_partitions;
use crate::profiler::ProfilerExecutor;
use accel_core::devices::{
    CperRecordList, DeviceList, EccCounter, EventList, EventSeverity, GpuDevice,
};
use accel_core::{
    ControlPlaneClient, DeviceClient, DeviceId, DeviceKind, DeviceSelector, Error,
    ExporterConfig, HealthStates, HealthVerdict, LabelName, LabelSet, Result, SnapshotCache,
    WorkloadMap, WorkloadRecord,
};
use accel_metrics::FieldGauges;
use accel_scheduler::Attributor;
use async_trait::async_trait;
use prometheus::Registry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration-derived state, replaced by `init_configs`
struct Exporting {
    hostname: String,
    selector: DeviceSelector,
    labels: LabelSet,
    gauges: FieldGauges,
    static_gauges: FieldGauges,
    profiler_enabled: bool,
    query_workloads: bool,
}

/// Device client for GPUs
pub struct GpuClient {
    control_plane: Arc<dyn ControlPlaneClient>,
    registry: Registry,
    profiler: Option<Arc<ProfilerExecutor>>,
    attributor: Option<Arc<Attributor>>,
    devices: SnapshotCache<DeviceList>,
    events: SnapshotCache<EventList>,
    records: SnapshotCache<CperRecordList>,
    exporting: RwLock<Option<Exporting>>,
    health: Arc<SharedHealth>,
    partitions: RwLock<BTreeMap<String, Vec<GpuDevice>>>,
    active: AtomicBool,
}

impl GpuClient {
    pub fn new(control_plane: Arc<dyn ControlPlaneClient>, registry: Registry) -> Self {
        Self {
            control_plane,
            registry,
            profiler: None,
            attributor: None,
            devices: SnapshotCache::new("gpu devices"),
            events: SnapshotCache::new("gpu events"),
            records: SnapshotCache::new("gpu cper"),
            exporting: RwLock::new(None),
            health: Arc::new(SharedHealth::new()),
            partitions: RwLock::new(BTreeMap::new()),
            active: AtomicBool::new(false),
        }
    }

    /// Merge counters from a profiler executor that outlives this client
    pub fn with_profiler(mut self, profiler: Arc<ProfilerExecutor>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Keep overrides and verdicts in a store that outlives this client
    pub fn with_shared_health(mut self, health: Arc<SharedHealth>) -> Self {
        self.health = health;
        self
    }

    /// Attribute devices to workloads
    pub fn with_attributor(mut self, attributor: Arc<Attributor>) -> Self {
        self.attributor = Some(attributor);
        self
    }

    /// Partition devices from the last refresh, keyed by base bus address
    pub async fn partitions(&self) -> BTreeMap<String, Vec<GpuDevice>> {
        self.partitions.read().await.clone()
    }

    async fn fetch_devices(&self) -> Result<Arc<DeviceList>> {
        let control_plane = &self.control_plane;
        self.devices
            .read(move || async move {
                let list = control_plane.get_devices().await?;
                list.status.check("get_devices")?;
                Ok::<_, Error>(list)
            })
            .await
    }

    async fn fetch_events(&self) -> Result<Arc<EventList>> {
        let control_plane = &self.control_plane;
        self.events
            .read(move || async move {
                let list = control_plane.get_events(EventSeverity::Critical).await?;
                list.status.check("get_events")?;
                Ok::<_, Error>(list)
            })
            .await
    }

    async fn fetch_records(&self) -> Result<Arc<CperRecordList>> {
        let control_plane = &self.control_plane;
        self.records
            .read(move || async move {
                let list = control_plane
                    .get_vendor_error_records(EventSeverity::Warn)
                    .await?;
                list.status.check("get_vendor_error_records")?;
                Ok::<_, Error>(list)
            })
            .await
    }

    /// Profiler counters by logical node; empty on any profiler failure
    async fn profiler_counters(&self) -> BTreeMap<u32, BTreeMap<String, f64>> {
        let Some(profiler) = &self.profiler else {
            return BTreeMap::new();
        };
        match profiler.get_metrics().await {
            Ok(report) => report.by_node(),
            Err(e) => {
                debug!("Profiler counters unavailable: {}", e);
                BTreeMap::new()
            }
        }
    }

    async fn workloads(&self) -> WorkloadMap {
        let Some(attributor) = &self.attributor else {
            return WorkloadMap::new();
        };
        match attributor.list_workloads().await {
            Ok(workloads) => workloads,
            Err(e) => {
                warn!("Workload attribution failed: {}", e);
                WorkloadMap::new()
            }
        }
    }

    /// Check that the device is known to the last evaluation or snapshot
    async fn ensure_known(&self, id: &DeviceId) -> Result<()> {
        if self.health.contains(id).await {
            return Ok(());
        }
        if let Some(list) = self.devices.peek().await {
            if split_partitions(&list.devices).physical.iter().any(|d| &d.id() == id) {
                return Ok(());
            }
        }
        Err(Error::not_found(format!("GPU {}", id)))
    }

}

fn device_labels(
    device: &GpuDevice,
    hostname: &str,
    labels: &LabelSet,
    workload: Option<&WorkloadRecord>,
) -> BTreeMap<String, String> {
    let spec = &device.spec;
    let status = &device.status;
    let mut values: BTreeMap<String, String> = [
        (LabelName::GpuId, device.index().to_string()),
        (LabelName::GpuUuid, device.id().to_string()),
        (LabelName::SerialNumber, spec.serial_number.clone()),
        (LabelName::CardModel, spec.card_model.clone()),
        (LabelName::CardVendor, spec.card_vendor.clone()),
        (LabelName::DriverVersion, status.driver_version.clone()),
        (LabelName::VbiosVersion, spec.vbios_version.clone()),
        (LabelName::Hostname, hostname.to_string()),
        (LabelName::GpuPartitionId, status.partition_id.to_string()),
        (LabelName::GpuComputePartitionType, spec.compute_partition_type.clone()),
        (LabelName::GpuMemoryPartitionType, spec.memory_partition_type.clone()),
    ]
    .into_iter()
    .filter(|(name, _)| labels.contains(*name))
    .map(|(name, value)| (name.as_str().to_string(), value))
    .collect();

    if let Some(record) = workload {
        for (key, value) in record.labels() {
            values.insert(key.to_string(), value);
        }
    }

    for (key, value) in labels.custom() {
        values.insert(key.clone(), value.clone());
    }
    values
}

#[async_trait]
impl DeviceClient for GpuClient {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.control_plane.is_connected()
    }

    async fn init_configs(&self, config: &ExporterConfig) -> Result<()> {
        let labels = config.gpu_labels();
        let specs = fields::resolve(&config.gpu.fields, config.gpu.profiler_enabled && self.profiler.is_some());

        let mut exporting = self.exporting.write().await;
        if let Some(previous) = exporting.take() {
            previous.gauges.unregister();
            previous.static_gauges.unregister();
        }

        let gauges = FieldGauges::register(&self.registry, &specs, labels.names())
            .map_err(|e| Error::config(format!("GPU gauges: {}", e)))?;

        let mut static_labels = vec![LabelName::Hostname.as_str().to_string()];
        static_labels.extend(labels.custom().keys().cloned());
        let static_gauges = match FieldGauges::register(&self.registry, &fields::static_catalogue(), static_labels) {
            Ok(static_gauges) => static_gauges,
            Err(e) => {
                gauges.unregister();
                return Err(Error::config(format!("GPU static gauges: {}", e)));
            }
        };

        let query_workloads = self
            .attributor
            .as_ref()
            .map(|a| a.check_export_labels(&labels))
            .unwrap_or(false);

        info!(
            "GPU client configured with {} fields, labels {:?}, workload attribution {}",
            gauges.len(),
            labels.names(),
            if query_workloads { "on" } else { "off" }
        );

        *exporting = Some(Exporting {
            hostname: config.hostname.clone(),
            selector: config.gpu_selector(),
            labels,
            gauges,
            static_gauges,
            profiler_enabled: config.gpu.profiler_enabled,
            query_workloads,
        });
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn update_static_metrics(&self) -> Result<()> {
        let list = self.fetch_devices().await?;
        let physical = split_partitions(&list.devices).physical.len();

        let exporting = self.exporting.read().await;
        let Some(exporting) = exporting.as_ref() else {
            return Err(Error::unavailable("GPU client is not configured"));
        };
        let mut labels = BTreeMap::new();
        labels.insert(LabelName::Hostname.as_str().to_string(), exporting.hostname.clone());
        for (key, value) in exporting.labels.custom() {
            labels.insert(key.clone(), value.clone());
        }
        exporting.static_gauges.set(GPU_NODES_TOTAL, &labels, physical as f64);
        Ok(())
    }

    async fn update_metrics_stats(&self) -> Result<()> {
        let list = self.fetch_devices().await?;
        let records = self.fetch_records().await?;

        let view = split_partitions(&list.devices);
        *self.partitions.write().await = view.partitions;

        let exporting = self.exporting.read().await;
        let Some(exporting) = exporting.as_ref() else {
            return Err(Error::unavailable("GPU client is not configured"));
        };

        let latest_cper = latest_per_device(&records.records);
        let profiler = if exporting.profiler_enabled {
            self.profiler_counters().await
        } else {
            BTreeMap::new()
        };
        let workloads = if exporting.query_workloads {
            self.workloads().await
        } else {
            WorkloadMap::new()
        };
        let health = self.health.states().await;

        let mut batch = exporting.gauges.batch();
        let mut exported = 0;
        for device in view.physical.iter().filter(|d| exporting.selector.contains(d.index())) {
            let id = device.id();
            let bus_id = device.status.pcie_bus_id.trim().to_ascii_lowercase();
            let index = device.index().to_string();
            let workload = Attributor::resolve(&workloads, &[bus_id.as_str(), index.as_str()]);
            let labels = device_labels(device, &exporting.hostname, &exporting.labels, workload);
            let verdict = health
                .as_ref()
                .and_then(|states| states.get(&id))
                .map(|state| state.verdict);

            for (field, value) in fields::device_values(
                device,
                verdict,
                latest_cper.get(&id),
                profiler.get(&device.status.kfd_node_id),
            ) {
                batch.set(&field, &labels, value);
            }
            exported += 1;
        }
        batch.commit().await;
        debug!("Exported metrics for {} GPUs", exported);
        Ok(())
    }

    async fn process_health_validation(&self) -> Result<()> {
        // Both snapshots must be fetched before anything is published
        let list = self.fetch_devices().await?;
        let events = self.fetch_events().await?;

        let physical = split_partitions(&list.devices).physical;
        let overrides = self.health.overrides().await;
        let states = evaluate(&physical, &events.events, &overrides);

        let unhealthy = states
            .values()
            .filter(|s| s.verdict == HealthVerdict::Unhealthy)
            .count();
        if unhealthy > 0 {
            warn!("{} of {} GPUs unhealthy", unhealthy, states.len());
        } else {
            debug!("All {} GPUs healthy", states.len());
        }

        self.health.publish(states).await;
        Ok(())
    }

    async fn get_health_states(&self) -> Option<HealthStates> {
        self.health.states().await
    }

    async fn set_error(&self, id: &DeviceId, fields: &[String], counts: &[u64]) -> Result<()> {
        if fields.len() != counts.len() {
            return Err(Error::invalid_request(format!(
                "{} fields but {} counts",
                fields.len(),
                counts.len()
            )));
        }
        let unknown: BTreeSet<&str> = fields
            .iter()
            .filter(|f| EccCounter::from_field_name(f).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(Error::invalid_request(format!("unknown ECC fields {:?}", unknown)));
        }
        self.ensure_known(id).await?;

        let verdict = if counts.iter().any(|&count| count > 0) {
            HealthVerdict::Unhealthy.as_str()
        } else {
            ""
        };
        self.health.apply_override(id, verdict).await;
        Ok(())
    }

    async fn set_health_override(&self, id: &DeviceId, verdict: &str) -> Result<()> {
        self.ensure_known(id).await?;
        self.health.apply_override(id, verdict).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        if let Some(exporting) = self.exporting.write().await.take() {
            exporting.gauges.unregister();
            exporting.static_gauges.unregister();
        }
        self.devices.invalidate().await;
        self.events.invalidate().await;
        self.records.invalidate().await;
        info!("GPU client closed");
        Ok(())
    }
}
