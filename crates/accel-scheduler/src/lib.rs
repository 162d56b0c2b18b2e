//! # accel-scheduler
//!
//! Workload attribution for the accelerator telemetry exporter.
//!
//! - [`Attributor`] merges device-to-workload maps from every enabled back end
//! - [`KubernetesBackend`] maps GPUs to pods from kubelet pod resources
//! - [`SlurmBackend`] maps GPUs to jobs from asynchronous job notifications

use thiserror::Error;

pub mod attributor;
pub mod kubernetes;
pub mod slurm;

pub use attributor::Attributor;
pub use kubernetes::{
    AllocationMode, FilePodResources, KubernetesBackend, PodResources, PodResourcesSource,
};
pub use slurm::{JobNotification, SlurmBackend};

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised by the scheduler back ends
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Pod resources unavailable: {0}")]
    PodResources(String),

    #[error("Invalid job notification: {0}")]
    InvalidNotification(String),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::PodResources(_) | SchedulerError::Io(_))
    }
}

impl From<SchedulerError> for accel_core::Error {
    fn from(e: SchedulerError) -> Self {
        accel_core::Error::scheduler(e.to_string())
    }
}
