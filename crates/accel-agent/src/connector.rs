//! Control-plane connections
//!
//! The control-plane process publishes its view of the node as a JSON
//! snapshot document. [`FileControlPlane`] serves every call from that
//! document, re-reading it each time, so cache expiry in the device clients
//! maps onto fresh reads.

use accel_core::devices::{
    ApiStatus, CperRecord, CperRecordList, DeviceList, EventList, EventSeverity, GpuDevice,
    GpuEvent, NicDevice, NicDeviceList, NicPort, NicPortList, NicStation, NicStationList,
};
use accel_core::{ControlPlaneClient, Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Opens control-plane connections for the coordinator
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ControlPlaneClient>>;
}

/// Snapshot document published by the control-plane process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneDocument {
    /// Status attached to every response
    pub status: ApiStatus,
    pub devices: Vec<GpuDevice>,
    pub events: Vec<GpuEvent>,
    pub vendor_error_records: Vec<CperRecord>,
    pub nic_devices: Vec<NicDevice>,
    pub nic_stations: Vec<NicStation>,
    pub nic_ports: Vec<NicPort>,
}

/// Control-plane client backed by a snapshot document on disk
pub struct FileControlPlane {
    path: PathBuf,
    closed: AtomicBool,
}

impl FileControlPlane {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            closed: AtomicBool::new(false),
        }
    }

    async fn load(&self) -> Result<ControlPlaneDocument> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport("control-plane connection is closed"));
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::transport(format!("read {}: {}", self.path.display(), e)))?;
        let document: ControlPlaneDocument = serde_json::from_slice(&bytes)
            .with_context(format!("parse {}", self.path.display()))?;
        Ok(document)
    }
}

#[async_trait]
impl ControlPlaneClient for FileControlPlane {
    async fn get_devices(&self) -> Result<DeviceList> {
        let doc = self.load().await?;
        Ok(DeviceList {
            status: doc.status,
            devices: doc.devices,
        })
    }

    async fn get_events(&self, severity: EventSeverity) -> Result<EventList> {
        let doc = self.load().await?;
        Ok(EventList {
            status: doc.status,
            events: doc.events.into_iter().filter(|e| e.severity >= severity).collect(),
        })
    }

    async fn get_vendor_error_records(&self, severity: EventSeverity) -> Result<CperRecordList> {
        let doc = self.load().await?;
        Ok(CperRecordList {
            status: doc.status,
            records: doc
                .vendor_error_records
                .into_iter()
                .filter(|r| r.severity >= severity)
                .collect(),
        })
    }

    async fn get_nic_devices(&self) -> Result<NicDeviceList> {
        let doc = self.load().await?;
        Ok(NicDeviceList {
            status: doc.status,
            devices: doc.nic_devices,
        })
    }

    async fn get_nic_stations(&self) -> Result<NicStationList> {
        let doc = self.load().await?;
        Ok(NicStationList {
            status: doc.status,
            stations: doc.nic_stations,
        })
    }

    async fn get_nic_ports(&self) -> Result<NicPortList> {
        let doc = self.load().await?;
        Ok(NicPortList {
            status: doc.status,
            ports: doc.nic_ports,
        })
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed control-plane snapshot {}", self.path.display());
        }
        Ok(())
    }
}

/// Connects to the snapshot document at a fixed path
pub struct FileConnector {
    path: PathBuf,
}

impl FileConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Connector for FileConnector {
    async fn connect(&self) -> Result<Arc<dyn ControlPlaneClient>> {
        tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| Error::transport(format!("control plane at {}: {}", self.path.display(), e)))?;
        info!("Connected to control-plane snapshot {}", self.path.display());
        Ok(Arc::new(FileControlPlane::new(self.path.clone())))
    }
}
