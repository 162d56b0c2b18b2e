//! Mock control plane for testing

use crate::devices::*;
use crate::traits::ControlPlaneClient;
use crate::{Error, Result};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// How the mock should fail its calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Return a transport error
    Transport,
    /// Return a response carrying a non-OK status
    Status(i32),
}

/// Per-operation call counters
#[derive(Debug, Default)]
pub struct MockCallCounts {
    pub devices: AtomicUsize,
    pub events: AtomicUsize,
    pub records: AtomicUsize,
    pub nic_devices: AtomicUsize,
    pub nic_stations: AtomicUsize,
    pub nic_ports: AtomicUsize,
}

/// In-memory control plane with programmable responses
#[derive(Debug, Default)]
pub struct MockControlPlane {
    devices: RwLock<Vec<GpuDevice>>,
    events: RwLock<Vec<GpuEvent>>,
    records: RwLock<Vec<CperRecord>>,
    nic_devices: RwLock<Vec<NicDevice>>,
    nic_stations: RwLock<Vec<NicStation>>,
    nic_ports: RwLock<Vec<NicPort>>,
    failure: RwLock<Option<MockFailure>>,
    closed: AtomicBool,
    pub calls: MockCallCounts,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock with `count` physical GPUs on consecutive buses
    pub fn with_gpus(count: u32) -> Self {
        Self {
            devices: RwLock::new((0..count).map(mock_gpu).collect()),
            ..Default::default()
        }
    }

    pub async fn set_devices(&self, devices: Vec<GpuDevice>) {
        *self.devices.write().await = devices;
    }

    pub async fn set_events(&self, events: Vec<GpuEvent>) {
        *self.events.write().await = events;
    }

    pub async fn set_records(&self, records: Vec<CperRecord>) {
        *self.records.write().await = records;
    }

    pub async fn set_nic(&self, devices: Vec<NicDevice>, stations: Vec<NicStation>, ports: Vec<NicPort>) {
        *self.nic_devices.write().await = devices;
        *self.nic_stations.write().await = stations;
        *self.nic_ports.write().await = ports;
    }

    /// Make every subsequent call fail; `None` restores normal behaviour
    pub async fn set_failure(&self, failure: Option<MockFailure>) {
        *self.failure.write().await = failure;
    }

    /// Mutate one device in place, e.g. to raise an ECC counter
    pub async fn update_device<F>(&self, index: u32, f: F)
    where
        F: FnOnce(&mut GpuDevice),
    {
        if let Some(device) = self.devices.write().await.iter_mut().find(|d| d.index() == index) {
            f(device);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn status(&self) -> Result<ApiStatus> {
        match &*self.failure.read().await {
            None => Ok(ApiStatus::ok()),
            Some(MockFailure::Transport) => Err(Error::transport("mock transport failure")),
            Some(MockFailure::Status(code)) => Ok(ApiStatus::failed(*code, "mock status failure")),
        }
    }
}

#[async_trait]
impl ControlPlaneClient for MockControlPlane {
    async fn get_devices(&self) -> Result<DeviceList> {
        self.calls.devices.fetch_add(1, Ordering::SeqCst);
        let status = self.status().await?;
        let devices = self.devices.read().await.clone();
        debug!("Mock control plane returned {} devices", devices.len());
        Ok(DeviceList { status, devices })
    }

    async fn get_events(&self, severity: EventSeverity) -> Result<EventList> {
        self.calls.events.fetch_add(1, Ordering::SeqCst);
        let status = self.status().await?;
        let events = self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.severity >= severity)
            .cloned()
            .collect();
        Ok(EventList { status, events })
    }

    async fn get_vendor_error_records(&self, severity: EventSeverity) -> Result<CperRecordList> {
        self.calls.records.fetch_add(1, Ordering::SeqCst);
        let status = self.status().await?;
        let records = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.severity >= severity)
            .cloned()
            .collect();
        Ok(CperRecordList { status, records })
    }

    async fn get_nic_devices(&self) -> Result<NicDeviceList> {
        self.calls.nic_devices.fetch_add(1, Ordering::SeqCst);
        let status = self.status().await?;
        let devices = self.nic_devices.read().await.clone();
        Ok(NicDeviceList { status, devices })
    }

    async fn get_nic_stations(&self) -> Result<NicStationList> {
        self.calls.nic_stations.fetch_add(1, Ordering::SeqCst);
        let status = self.status().await?;
        let stations = self.nic_stations.read().await.clone();
        Ok(NicStationList { status, stations })
    }

    async fn get_nic_ports(&self) -> Result<NicPortList> {
        self.calls.nic_ports.fetch_add(1, Ordering::SeqCst);
        let status = self.status().await?;
        let ports = self.nic_ports.read().await.clone();
        Ok(NicPortList { status, ports })
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Physical GPU with a deterministic UUID and bus address
pub fn mock_gpu(index: u32) -> GpuDevice {
    let mut uuid = vec![0u8; 16];
    uuid[0] = 0xa1;
    uuid[15] = index as u8;
    GpuDevice {
        uuid,
        spec: GpuSpec {
            index,
            card_model: "MI300X".to_string(),
            card_vendor: "Advanced Micro Devices, Inc.".to_string(),
            serial_number: format!("SN{:04}", index),
            vbios_version: "113-M3000100-102".to_string(),
            ..Default::default()
        },
        status: GpuStatus {
            pcie_bus_id: format!("0000:{:02x}:00.0", 0x03 + index * 0x10),
            kfd_node_id: index + 2,
            driver_version: "6.8.5".to_string(),
            ..Default::default()
        },
        stats: GpuStats {
            package_power: 350.0 + f64::from(index),
            edge_temperature: 40.0,
            junction_temperature: 55.0,
            gfx_activity: 12.0,
            used_vram: 1024.0,
            total_vram: 196_608.0,
            ..Default::default()
        },
    }
}

/// Critical event for the given device
pub fn mock_critical_event(device: &GpuDevice) -> GpuEvent {
    GpuEvent {
        device_uuid: device.uuid.clone(),
        severity: EventSeverity::Critical,
        category: "RAS".to_string(),
        description: "uncorrectable error".to_string(),
    }
}
