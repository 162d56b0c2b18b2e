//! # accel-core
//!
//! Core types, traits, and utilities for the accelerator telemetry exporter.
//!
//! This crate provides the foundational data structures and interfaces that
//! are shared across all other exporter components. It includes:
//!
//! - The control-plane snapshot data model for GPUs and NICs
//! - The TTL snapshot cache that coalesces remote fetches
//! - Traits for the control plane, device clients, schedulers and node labels
//! - The exporter configuration surface, label catalogue and device selector
//! - Error handling types and utilities

pub mod cache;
pub mod config;
pub mod devices;
pub mod error;
pub mod labels;
pub mod selector;
pub mod traits;
pub mod types;

#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export commonly used types at the crate root
pub use cache::{SnapshotCache, REMOTE_CALL_TIMEOUT, SNAPSHOT_TTL};
pub use config::{ExporterConfig, GpuConfig, NicConfig};
pub use error::{Error, ErrorContext, Result};
pub use labels::{LabelName, LabelSet, MAX_CUSTOM_LABELS};
pub use selector::{DeviceSelector, MAX_DEVICE_INDEX};
pub use traits::{
    ControlPlaneClient, DeviceClient, DeviceHealth, HealthStates, NodeLabeller, SchedulerBackend,
    WorkloadMap,
};
pub use types::{DeviceId, DeviceKind, HealthVerdict, SchedulerKind, WorkloadInfo, WorkloadRecord};
