//! Configuration management for the exporter agent

use accel_core::ExporterConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for the exporter agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent-specific configuration
    pub agent: AgentSpecificConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Served endpoints
    pub services: ServicesConfig,

    /// Where control-plane snapshots come from
    pub control_plane: ControlPlaneConfig,

    /// External profiler invocation
    pub profiler: ProfilerConfig,

    /// Workload scheduler back ends
    pub scheduler: SchedulerConfig,

    /// Fields, labels and device selection
    pub exporter: ExporterConfig,
}

/// Agent-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpecificConfig {
    /// Agent name/identifier
    pub name: String,

    /// Period of the health poll loop (seconds)
    pub poll_interval_seconds: u64,

    /// Graceful shutdown timeout (seconds)
    pub shutdown_timeout_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

/// Served endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Prometheus `/metrics` endpoint
    pub metrics: ServiceConfig,

    /// gRPC health query service
    pub health: ServiceConfig,
}

/// One served endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

/// Control-plane snapshot source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// JSON snapshot document maintained by the control-plane process
    pub snapshot_file: PathBuf,
}

/// External profiler invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Program printing the profiler JSON document; empty disables the profiler
    pub program: String,

    pub args: Vec<String>,
}

/// Workload scheduler back ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pod resources document written by the kubelet bridge
    pub pod_resources_file: PathBuf,

    /// Device-plugin resource name
    pub resource_name: String,

    /// Dynamic resource allocation driver name
    pub dra_driver: String,

    /// UDP address receiving Slurm job notifications
    pub slurm_listen_addr: SocketAddr,
}

impl Default for AgentSpecificConfig {
    fn default() -> Self {
        Self {
            name: "accel-exporter".to_string(),
            poll_interval_seconds: 30,
            shutdown_timeout_seconds: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            metrics: ServiceConfig {
                enabled: true,
                bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            },
            health: ServiceConfig {
                enabled: true,
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 50061)),
            },
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            snapshot_file: PathBuf::from("/var/run/accel-exporter/control-plane.json"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pod_resources_file: PathBuf::from("/var/run/accel-exporter/pod-resources.json"),
            resource_name: "amd.com/gpu".to_string(),
            dra_driver: "gpu.amd.com".to_string(),
            slurm_listen_addr: SocketAddr::from(([127, 0, 0, 1], 6601)),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML (or JSON) file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::AgentError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AgentConfig = serde_yaml::from_str(&content)
            .map_err(|e| crate::AgentError::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> crate::Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| crate::AgentError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::AgentError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.exporter
            .validate()
            .map_err(|e| crate::AgentError::Config(format!("Exporter config validation failed: {}", e)))?;

        if self.agent.name.is_empty() {
            return Err(crate::AgentError::Config("Agent name cannot be empty".to_string()));
        }

        if self.agent.poll_interval_seconds == 0 {
            return Err(crate::AgentError::Config("Poll interval must be greater than 0".to_string()));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(crate::AgentError::Config(format!("Invalid log level: {}", self.logging.level))),
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => return Err(crate::AgentError::Config(format!("Invalid log format: {}", self.logging.format))),
        }

        if self.exporter.gpu.profiler_enabled && self.profiler.program.is_empty() {
            return Err(crate::AgentError::Config(
                "Profiler is enabled but no profiler program is configured".to_string(),
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.agent.poll_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.shutdown_timeout_seconds)
    }
}
