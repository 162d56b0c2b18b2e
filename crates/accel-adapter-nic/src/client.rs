//! NIC device client

use crate::fields::{self, NIC_NODES_TOTAL};
use accel_core::devices::{NicDevice, NicDeviceList, NicPort, NicPortList, NicStation, NicStationList};
use accel_core::{
    ControlPlaneClient, DeviceClient, DeviceId, DeviceKind, Error, ExporterConfig, HealthStates,
    LabelName, LabelSet, Result, SnapshotCache,
};
use accel_metrics::FieldGauges;
use async_trait::async_trait;
use prometheus::Registry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One port joined with its station and device
#[derive(Debug, Clone, Copy)]
pub struct PortView<'a> {
    pub device: &'a NicDevice,
    pub station: &'a NicStation,
    pub port: &'a NicPort,
}

/// Join ports to stations and devices by id.
///
/// Ports whose station, or whose station's device, is unknown are skipped.
pub fn join_ports<'a>(
    devices: &'a [NicDevice],
    stations: &'a [NicStation],
    ports: &'a [NicPort],
) -> Vec<PortView<'a>> {
    let devices: HashMap<&str, &NicDevice> = devices.iter().map(|d| (d.id.as_str(), d)).collect();
    let stations: HashMap<&str, &NicStation> = stations.iter().map(|s| (s.id.as_str(), s)).collect();

    ports
        .iter()
        .filter_map(|port| {
            let Some(station) = stations.get(port.station_id.as_str()).copied() else {
                debug!("Skipping port {} of unknown station {}", port.name, port.station_id);
                return None;
            };
            let Some(device) = devices.get(station.device_id.as_str()).copied() else {
                debug!("Skipping port {} of unknown device {}", port.name, station.device_id);
                return None;
            };
            Some(PortView {
                device,
                station,
                port,
            })
        })
        .collect()
}

struct Exporting {
    hostname: String,
    labels: LabelSet,
    gauges: FieldGauges,
    static_gauges: FieldGauges,
}

/// Device client for network adapters
pub struct NicClient {
    control_plane: Arc<dyn ControlPlaneClient>,
    registry: Registry,
    devices: SnapshotCache<NicDeviceList>,
    stations: SnapshotCache<NicStationList>,
    ports: SnapshotCache<NicPortList>,
    exporting: RwLock<Option<Exporting>>,
    active: AtomicBool,
}

impl NicClient {
    pub fn new(control_plane: Arc<dyn ControlPlaneClient>, registry: Registry) -> Self {
        Self {
            control_plane,
            registry,
            devices: SnapshotCache::new("nic devices"),
            stations: SnapshotCache::new("nic stations"),
            ports: SnapshotCache::new("nic ports"),
            exporting: RwLock::new(None),
            active: AtomicBool::new(false),
        }
    }

    async fn fetch_devices(&self) -> Result<Arc<NicDeviceList>> {
        let control_plane = &self.control_plane;
        self.devices
            .read(move || async move {
                let list = control_plane.get_nic_devices().await?;
                list.status.check("get_nic_devices")?;
                Ok::<_, Error>(list)
            })
            .await
    }

    async fn fetch_stations(&self) -> Result<Arc<NicStationList>> {
        let control_plane = &self.control_plane;
        self.stations
            .read(move || async move {
                let list = control_plane.get_nic_stations().await?;
                list.status.check("get_nic_stations")?;
                Ok::<_, Error>(list)
            })
            .await
    }

    async fn fetch_ports(&self) -> Result<Arc<NicPortList>> {
        let control_plane = &self.control_plane;
        self.ports
            .read(move || async move {
                let list = control_plane.get_nic_ports().await?;
                list.status.check("get_nic_ports")?;
                Ok::<_, Error>(list)
            })
            .await
    }
}

fn port_labels(view: &PortView<'_>, hostname: &str, labels: &LabelSet) -> BTreeMap<String, String> {
    let mut values: BTreeMap<String, String> = [
        (LabelName::NicId, view.device.index.to_string()),
        (LabelName::NicSerialNumber, view.device.serial_number.clone()),
        (LabelName::NicStationName, view.station.name.clone()),
        (LabelName::NicPortName, view.port.name.clone()),
        (LabelName::CardModel, view.device.product_name.clone()),
        (LabelName::Hostname, hostname.to_string()),
    ]
    .into_iter()
    .filter(|(name, _)| labels.contains(*name))
    .map(|(name, value)| (name.as_str().to_string(), value))
    .collect();
    values.extend(labels.custom().iter().map(|(k, v)| (k.clone(), v.clone())));
    values
}

#[async_trait]
impl DeviceClient for NicClient {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Nic
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.control_plane.is_connected()
    }

    async fn init_configs(&self, config: &ExporterConfig) -> Result<()> {
        let labels = config.nic_labels();
        let specs = fields::resolve(&config.nic.fields);

        let mut exporting = self.exporting.write().await;
        if let Some(previous) = exporting.take() {
            previous.gauges.unregister();
            previous.static_gauges.unregister();
        }

        let gauges = FieldGauges::register(&self.registry, &specs, labels.names())
            .map_err(|e| Error::config(format!("NIC gauges: {}", e)))?;
        let mut static_labels = vec![LabelName::Hostname.as_str().to_string()];
        static_labels.extend(labels.custom().keys().cloned());
        let static_gauges = match FieldGauges::register(&self.registry, &fields::static_catalogue(), static_labels) {
            Ok(static_gauges) => static_gauges,
            Err(e) => {
                gauges.unregister();
                return Err(Error::config(format!("NIC static gauges: {}", e)));
            }
        };

        info!("NIC client configured with {} fields", gauges.len());
        *exporting = Some(Exporting {
            hostname: config.hostname.clone(),
            labels,
            gauges,
            static_gauges,
        });
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn update_static_metrics(&self) -> Result<()> {
        let devices = self.fetch_devices().await?;
        let exporting = self.exporting.read().await;
        let Some(exporting) = exporting.as_ref() else {
            return Err(Error::unavailable("NIC client is not configured"));
        };
        let mut labels = BTreeMap::new();
        labels.insert(LabelName::Hostname.as_str().to_string(), exporting.hostname.clone());
        labels.extend(exporting.labels.custom().iter().map(|(k, v)| (k.clone(), v.clone())));
        exporting
            .static_gauges
            .set(NIC_NODES_TOTAL, &labels, devices.devices.len() as f64);
        Ok(())
    }

    async fn update_metrics_stats(&self) -> Result<()> {
        let devices = self.fetch_devices().await?;
        let stations = self.fetch_stations().await?;
        let ports = self.fetch_ports().await?;

        let exporting = self.exporting.read().await;
        let Some(exporting) = exporting.as_ref() else {
            return Err(Error::unavailable("NIC client is not configured"));
        };

        let joined = join_ports(&devices.devices, &stations.stations, &ports.ports);
        let mut batch = exporting.gauges.batch();
        for view in &joined {
            let labels = port_labels(view, &exporting.hostname, &exporting.labels);
            for (field, value) in fields::port_values(&view.port.stats) {
                batch.set(field, &labels, value);
            }
        }
        batch.commit().await;
        debug!("Exported metrics for {} of {} NIC ports", joined.len(), ports.ports.len());
        Ok(())
    }

    async fn process_health_validation(&self) -> Result<()> {
        Ok(())
    }

    async fn get_health_states(&self) -> Option<HealthStates> {
        None
    }

    async fn set_error(&self, id: &DeviceId, _fields: &[String], _counts: &[u64]) -> Result<()> {
        debug!("Ignoring error injection for NIC {}", id);
        Ok(())
    }

    async fn set_health_override(&self, id: &DeviceId, _verdict: &str) -> Result<()> {
        debug!("Ignoring health override for NIC {}", id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        if let Some(exporting) = self.exporting.write().await.take() {
            exporting.gauges.unregister();
            exporting.static_gauges.unregister();
        }
        self.devices.invalidate().await;
        self.stations.invalidate().await;
        self.ports.invalidate().await;
        info!("NIC client closed");
        Ok(())
    }
}
