//! Snapshot data model returned by the control plane
//!
//! These structures mirror the control-plane responses one to one. They are
//! treated as immutable once fetched: the snapshot cache hands out shared
//! read-only views and never lets callers mutate a cached response.

use crate::types::DeviceId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Application-level status carried by every control-plane response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
    /// Zero means OK; anything else is an application failure
    #[serde(default)]
    pub code: i32,

    #[serde(default)]
    pub message: String,
}

impl ApiStatus {
    pub const OK: i32 = 0;

    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }

    /// Turn a non-OK status into an application error
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::application(
                self.code,
                format!("{} failed: {}", operation, self.message),
            ))
        }
    }
}

/// Severity filter for events and vendor error records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
    Critical,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSeverity::Debug => write!(f, "debug"),
            EventSeverity::Info => write!(f, "info"),
            EventSeverity::Warn => write!(f, "warn"),
            EventSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Hardware block covered by ECC counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EccBlock {
    Total,
    Sdma,
    Gfx,
    Mmhub,
    Athub,
    Bif,
    Hdp,
    XgmiWafl,
    Df,
    Smn,
    Sem,
    Mp0,
    Mp1,
    Fuse,
    Umc,
    Mca,
    Vcn,
    Jpeg,
}

impl EccBlock {
    pub const ALL: [EccBlock; 18] = [
        EccBlock::Total,
        EccBlock::Sdma,
        EccBlock::Gfx,
        EccBlock::Mmhub,
        EccBlock::Athub,
        EccBlock::Bif,
        EccBlock::Hdp,
        EccBlock::XgmiWafl,
        EccBlock::Df,
        EccBlock::Smn,
        EccBlock::Sem,
        EccBlock::Mp0,
        EccBlock::Mp1,
        EccBlock::Fuse,
        EccBlock::Umc,
        EccBlock::Mca,
        EccBlock::Vcn,
        EccBlock::Jpeg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EccBlock::Total => "TOTAL",
            EccBlock::Sdma => "SDMA",
            EccBlock::Gfx => "GFX",
            EccBlock::Mmhub => "MMHUB",
            EccBlock::Athub => "ATHUB",
            EccBlock::Bif => "BIF",
            EccBlock::Hdp => "HDP",
            EccBlock::XgmiWafl => "XGMI_WAFL",
            EccBlock::Df => "DF",
            EccBlock::Smn => "SMN",
            EccBlock::Sem => "SEM",
            EccBlock::Mp0 => "MP0",
            EccBlock::Mp1 => "MP1",
            EccBlock::Fuse => "FUSE",
            EccBlock::Umc => "UMC",
            EccBlock::Mca => "MCA",
            EccBlock::Vcn => "VCN",
            EccBlock::Jpeg => "JPEG",
        }
    }
}

/// Correctable or uncorrectable error counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EccKind {
    Correctable,
    Uncorrectable,
}

/// One ECC error counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EccCounter {
    pub block: EccBlock,
    pub kind: EccKind,
}

impl EccCounter {
    /// Every counter the health evaluator inspects
    pub fn all() -> impl Iterator<Item = EccCounter> {
        EccBlock::ALL.into_iter().flat_map(|block| {
            [EccKind::Correctable, EccKind::Uncorrectable]
                .into_iter()
                .map(move |kind| EccCounter { block, kind })
        })
    }

    /// Exported field name, e.g. `GPU_ECC_UNCORRECT_UMC`
    pub fn field_name(&self) -> String {
        let kind = match self.kind {
            EccKind::Correctable => "CORRECT",
            EccKind::Uncorrectable => "UNCORRECT",
        };
        format!("GPU_ECC_{}_{}", kind, self.block.as_str())
    }

    /// Reverse of [`EccCounter::field_name`], case-insensitive
    pub fn from_field_name(name: &str) -> Option<EccCounter> {
        let upper = name.trim().to_ascii_uppercase();
        EccCounter::all().find(|counter| counter.field_name() == upper)
    }
}

/// ECC counters of one device, keyed by block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EccStats {
    #[serde(default)]
    pub correctable: BTreeMap<EccBlock, u64>,

    #[serde(default)]
    pub uncorrectable: BTreeMap<EccBlock, u64>,
}

impl EccStats {
    /// Counter value; missing counters read as zero
    pub fn get(&self, counter: EccCounter) -> u64 {
        let map = match counter.kind {
            EccKind::Correctable => &self.correctable,
            EccKind::Uncorrectable => &self.uncorrectable,
        };
        map.get(&counter.block).copied().unwrap_or(0)
    }

    pub fn set(&mut self, counter: EccCounter, value: u64) {
        let map = match counter.kind {
            EccKind::Correctable => &mut self.correctable,
            EccKind::Uncorrectable => &mut self.uncorrectable,
        };
        map.insert(counter.block, value);
    }
}

/// Static description of a GPU
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSpec {
    pub index: u32,
    pub card_model: String,
    pub card_vendor: String,
    pub serial_number: String,
    pub vbios_version: String,
    pub compute_partition_type: String,
    pub memory_partition_type: String,
}

/// Dynamic status of a GPU
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuStatus {
    /// PCIe bus address, e.g. `0000:03:00.0`
    pub pcie_bus_id: String,

    /// Partition index of this device within its physical GPU
    pub partition_id: u32,

    /// Child partitions; non-empty only on logical container devices
    pub gpu_partitions: Vec<String>,

    /// Logical node identifier used by the profiler
    pub kfd_node_id: u32,

    pub driver_version: String,
}

/// Counters and gauges of a GPU
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuStats {
    pub package_power: f64,
    pub average_package_power: f64,
    pub edge_temperature: f64,
    pub junction_temperature: f64,
    pub memory_temperature: f64,
    pub gfx_activity: f64,
    pub umc_activity: f64,
    pub used_vram: f64,
    pub total_vram: f64,
    pub energy_consumed: f64,
    pub ecc: EccStats,
}

/// One GPU as reported by the control plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Raw 16-byte device UUID
    pub uuid: Vec<u8>,

    #[serde(default)]
    pub spec: GpuSpec,

    #[serde(default)]
    pub status: GpuStatus,

    #[serde(default)]
    pub stats: GpuStats,
}

impl GpuDevice {
    pub fn id(&self) -> DeviceId {
        DeviceId::from_uuid_bytes(&self.uuid)
    }

    pub fn index(&self) -> u32 {
        self.spec.index
    }
}

/// Response of `get_devices`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub status: ApiStatus,

    #[serde(default)]
    pub devices: Vec<GpuDevice>,
}

/// Asynchronous event reported for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuEvent {
    pub device_uuid: Vec<u8>,
    pub severity: EventSeverity,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub description: String,
}

/// Response of `get_events`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub status: ApiStatus,

    #[serde(default)]
    pub events: Vec<GpuEvent>,
}

/// Vendor error record ("CPER") entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CperRecord {
    pub device_uuid: Vec<u8>,
    pub severity: EventSeverity,

    /// Vendor timestamp, RFC 3339 or `YYYY/MM/DD HH:MM:SS`
    pub timestamp: String,

    #[serde(default)]
    pub record_id: String,

    #[serde(default)]
    pub notify_type: String,
}

/// Response of `get_vendor_error_records`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CperRecordList {
    #[serde(default)]
    pub status: ApiStatus,

    #[serde(default)]
    pub records: Vec<CperRecord>,
}

/// Network-offload adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicDevice {
    pub id: String,
    pub index: u32,
    pub serial_number: String,
    pub product_name: String,
    pub pcie_bus_id: String,
}

/// Station (host interface) within a NIC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicStation {
    pub id: String,
    pub device_id: String,
    pub name: String,
}

/// Port counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicPortStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub rx_drops: u64,
}

/// Network port attached to a station
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicPort {
    pub id: String,
    pub station_id: String,
    pub name: String,
    pub stats: NicPortStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicDeviceList {
    #[serde(default)]
    pub status: ApiStatus,

    #[serde(default)]
    pub devices: Vec<NicDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicStationList {
    #[serde(default)]
    pub status: ApiStatus,

    #[serde(default)]
    pub stations: Vec<NicStation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicPortList {
    #[serde(default)]
    pub status: ApiStatus,

    #[serde(default)]
    pub ports: Vec<NicPort>,
}
