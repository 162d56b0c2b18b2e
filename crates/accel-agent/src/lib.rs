//! # accel-agent
//!
//! Node agent (accel-exporterd daemon) of the accelerator telemetry exporter.
//!
//! The agent owns the control-plane connection and the device clients, runs
//! the periodic health poll, serves `/metrics`, and answers health queries
//! over gRPC.

pub mod agent;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod node_labeller;
pub mod services;

// Re-export commonly used types
pub use agent::{Agent, AgentBuilder};
pub use config::AgentConfig;
pub use connector::{Connector, ControlPlaneDocument, FileConnector, FileControlPlane};
pub use coordinator::Coordinator;
pub use node_labeller::MemoryNodeLabeller;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] accel_core::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] accel_metrics::MetricsError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] accel_scheduler::SchedulerError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize logging, then build the agent
pub async fn init_agent(config: &AgentConfig) -> Result<Agent> {
    init_logging(&config.logging)?;

    tracing::info!("Initializing exporter agent {}", config.agent.name);

    AgentBuilder::new().with_config(config.clone()).build().await
}

/// Initialize logging and tracing.
///
/// `RUST_LOG` wins over the configured level.
pub fn init_logging(logging_config: &config::LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let installed = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };
    installed.map_err(|e| AgentError::Config(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_convert() {
        let err: AgentError = accel_core::Error::not_found("gpu 7").into();
        assert!(matches!(err, AgentError::Core(_)));
        assert!(err.to_string().contains("gpu 7"));
    }

    #[test]
    fn test_init_logging_twice_is_an_error_not_a_panic() {
        let config = config::LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
