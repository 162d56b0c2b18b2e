//! Physical vs. partition device filtering
//!
//! A partitioned GPU is reported as several devices. Only physical devices
//! are health-evaluated and exported; partitions are kept in a side map
//! keyed by the base bus address of their parent.

use accel_core::devices::GpuDevice;
use std::collections::BTreeMap;

/// Role of a reported device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// A real GPU
    Physical,
    /// Container device listing its partitions
    Logical,
    /// One partition of a physical GPU
    Partition,
}

/// Bus address with the PCI function zeroed: `0000:03:00.1` to `0000:03:00.0`
pub fn base_bus_address(bus_id: &str) -> String {
    let bus_id = bus_id.trim().to_ascii_lowercase();
    match bus_id.rsplit_once('.') {
        Some((prefix, _function)) => format!("{}.0", prefix),
        None => bus_id,
    }
}

/// Classify one reported device
pub fn classify(device: &GpuDevice) -> DeviceClass {
    if !device.status.gpu_partitions.is_empty() {
        return DeviceClass::Logical;
    }
    let bus_id = device.status.pcie_bus_id.trim().to_ascii_lowercase();
    if device.status.partition_id != 0 || bus_id != base_bus_address(&bus_id) {
        DeviceClass::Partition
    } else {
        DeviceClass::Physical
    }
}

/// Device list split into physical devices and partitions
#[derive(Debug, Clone, Default)]
pub struct PartitionView {
    pub physical: Vec<GpuDevice>,

    /// Excluded devices keyed by base bus address
    pub partitions: BTreeMap<String, Vec<GpuDevice>>,
}

/// Split a device list, preserving order
pub fn split_partitions(devices: &[GpuDevice]) -> PartitionView {
    let mut view = PartitionView::default();
    for device in devices {
        match classify(device) {
            DeviceClass::Physical => view.physical.push(device.clone()),
            DeviceClass::Logical | DeviceClass::Partition => view
                .partitions
                .entry(base_bus_address(&device.status.pcie_bus_id))
                .or_default()
                .push(device.clone()),
        }
    }
    view
}
