//! # accel-adapter-gpu
//!
//! GPU device client for the accelerator telemetry exporter.
//!
//! This crate provides:
//! - The GPU [`GpuClient`] implementing the uniform device-client contract
//! - Physical/partition device filtering
//! - Health fusion of ECC counters, critical events and operator overrides
//! - Vendor error record (CPER) reduction to the latest record per device
//! - A circuit-breaking executor around the external profiler

use std::time::Duration;
use thiserror::Error;

pub mod client;
pub mod cper;
pub mod fields;
pub mod health;
pub mod partition;
pub mod profiler;

// Re-export main types
pub use client::GpuClient;
pub use cper::{latest_per_device, LatestCper};
pub use health::{evaluate, OverrideTable, SharedHealth};
pub use partition::{base_bus_address, split_partitions, DeviceClass, PartitionView};
pub use profiler::{
    BreakerState, CommandRunner, ProcessRunner, ProfilerExecutor, ProfilerReport,
};

/// Result type for GPU operations
pub type Result<T> = std::result::Result<T, GpuError>;

/// Errors that can occur during GPU operations
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Profiler failed: {0}")]
    ProfilerFailed(String),

    #[error("Profiler crashed: {0}")]
    ProfilerCrashed(String),

    #[error("Profiler disabled: {0}")]
    BreakerOpen(String),

    #[error("Profiler timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid profiler output: {0}")]
    InvalidOutput(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] accel_core::Error),
}

impl GpuError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, GpuError::ProfilerFailed(_) | GpuError::Timeout(_))
    }

    /// Check if this error disables the profiler for the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, GpuError::ProfilerCrashed(_))
    }
}

impl From<GpuError> for accel_core::Error {
    fn from(e: GpuError) -> Self {
        match e {
            GpuError::Core(e) => e,
            other => accel_core::Error::profiler(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_error_properties() {
        let failed = GpuError::ProfilerFailed("exit status 1".to_string());
        assert!(failed.is_retryable());
        assert!(!failed.is_fatal());

        let crashed = GpuError::ProfilerCrashed("core dumped".to_string());
        assert!(!crashed.is_retryable());
        assert!(crashed.is_fatal());

        let open = GpuError::BreakerOpen("3 consecutive failures".to_string());
        assert!(!open.is_retryable());
    }

    #[test]
    fn test_error_conversion() {
        let err: accel_core::Error = GpuError::Timeout(Duration::from_secs(15)).into();
        assert!(matches!(err, accel_core::Error::Profiler(_)));

        let err: accel_core::Error = GpuError::Core(accel_core::Error::transport("x")).into();
        assert!(matches!(err, accel_core::Error::Transport(_)));
    }
}
