//! # accel-metrics
//!
//! Metrics export for the accelerator telemetry exporter.
//!
//! - Labeled gauge sets, one gauge per enabled field
//! - Prometheus `/metrics` endpoint that refreshes device clients on scrape

pub mod gauges;
pub mod prometheus_metrics;

pub use gauges::{FieldGauges, GaugeSpec};
pub use prometheus_metrics::{PrometheusExporter, ScrapeSource};

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
