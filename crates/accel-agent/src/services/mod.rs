//! gRPC service implementations for the exporter agent

pub mod health;

// Re-export service implementations
pub use health::HealthQueryService;
