//! Core agent implementation

use crate::connector::{Connector, FileConnector};
use crate::coordinator::Coordinator;
use crate::node_labeller::MemoryNodeLabeller;
use crate::{config::AgentConfig, services, AgentError, Result};
use accel_adapter_gpu::{ProcessRunner, ProfilerExecutor};
use accel_metrics::{PrometheusExporter, ScrapeSource};
use accel_proto::HealthQueryServer;
use accel_scheduler::{Attributor, FilePodResources, KubernetesBackend, SlurmBackend};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};

/// The exporter agent
pub struct Agent {
    config: AgentConfig,
    registry: Registry,
    coordinator: Arc<Coordinator>,
    labeller: Arc<MemoryNodeLabeller>,
    slurm: Option<Arc<SlurmBackend>>,
    exporter: Option<PrometheusExporter>,
    health_addr: Option<SocketAddr>,
    slurm_addr: Option<SocketAddr>,
    services: Vec<ServiceHandle>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

/// Handle to a running service
struct ServiceHandle {
    name: String,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl Agent {
    /// Start the agent and all its services
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting exporter agent: {}", self.config.agent.name);

        if self.shutdown_tx.is_some() {
            return Err(AgentError::Service("Agent already started".to_string()));
        }

        if let Some(slurm) = &self.slurm {
            self.slurm_addr = Some(slurm.bind_udp(self.config.scheduler.slurm_listen_addr).await?);
        }

        if self.config.services.metrics.enabled {
            let mut exporter =
                PrometheusExporter::with_registry(self.config.services.metrics.bind_addr, self.registry.clone());
            let source: Arc<dyn ScrapeSource> = self.coordinator.clone();
            exporter.set_scrape_source(source);
            exporter.start_server().await?;
            info!("Metrics available at {}", exporter.metrics_url());
            self.exporter = Some(exporter);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if self.config.services.health.enabled {
            let handle = self.start_health_service(shutdown_rx.clone()).await?;
            self.services.push(ServiceHandle {
                name: "health-query".to_string(),
                handle,
            });
        }

        let coordinator = self.coordinator.clone();
        let handle = tokio::spawn(async move {
            coordinator.run(shutdown_rx).await;
            Ok(())
        });
        self.services.push(ServiceHandle {
            name: "poll-loop".to_string(),
            handle,
        });

        self.shutdown_tx = Some(shutdown_tx);
        info!("Exporter agent started with {} services", self.services.len());
        Ok(())
    }

    /// Stop the agent and all its services
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping exporter agent");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        let timeout = self.config.shutdown_timeout();
        for mut service in self.services.drain(..) {
            info!("Stopping service: {}", service.name);
            match tokio::time::timeout(timeout, &mut service.handle).await {
                Ok(Ok(Ok(()))) => info!("Service {} stopped successfully", service.name),
                Ok(Ok(Err(e))) => error!("Service {} stopped with error: {}", service.name, e),
                Ok(Err(e)) if e.is_cancelled() => info!("Service {} was cancelled", service.name),
                Ok(Err(e)) => error!("Failed to stop service {}: {}", service.name, e),
                Err(_) => {
                    warn!("Service {} did not stop within {:?}, aborting", service.name, timeout);
                    service.handle.abort();
                }
            }
        }

        if let Some(mut exporter) = self.exporter.take() {
            exporter.stop_server().await;
        }

        // Idempotent; covers a poll loop that had to be aborted
        self.coordinator.close().await;

        self.health_addr = None;
        self.slurm_addr = None;
        info!("Exporter agent stopped");
        Ok(())
    }

    /// Run the agent until a shutdown signal is received
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C signal");
            }
            _ = wait_for_termination() => {
                info!("Received termination signal");
            }
        }

        self.stop().await
    }

    /// Get the agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Registry behind `/metrics`
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Node labels published by the poll loop
    pub fn labeller(&self) -> &Arc<MemoryNodeLabeller> {
        &self.labeller
    }

    /// Bound address of the metrics endpoint, once started
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.exporter.as_ref().and_then(|e| e.local_addr())
    }

    /// Bound address of the health query service, once started
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Bound address of the Slurm notification listener, once started
    pub fn slurm_addr(&self) -> Option<SocketAddr> {
        self.slurm_addr
    }

    /// Start the health query service
    async fn start_health_service(
        &mut self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<tokio::task::JoinHandle<Result<()>>> {
        let listener = TcpListener::bind(self.config.services.health.bind_addr).await?;
        let bind_addr = listener.local_addr()?;
        self.health_addr = Some(bind_addr);

        let service = services::HealthQueryService::new(self.coordinator.clone());
        let mut shutdown = shutdown_rx;

        let handle = tokio::spawn(async move {
            info!("Starting health query service on {}", bind_addr);

            Server::builder()
                .add_service(HealthQueryServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
                .map_err(AgentError::Transport)?;

            info!("Health query service on {} stopped", bind_addr);
            Ok(())
        });

        Ok(handle)
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        // Best effort cleanup
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

/// Wait for SIGTERM
#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Only Ctrl+C is handled outside unix
#[cfg(not(unix))]
async fn wait_for_termination() {
    std::future::pending::<()>().await;
}

/// Builder for creating agents
pub struct AgentBuilder {
    config: Option<AgentConfig>,
    connector: Option<Arc<dyn Connector>>,
}

impl AgentBuilder {
    /// Create a new agent builder
    pub fn new() -> Self {
        Self {
            config: None,
            connector: None,
        }
    }

    /// Set the agent configuration
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the snapshot-file connector
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the agent
    pub async fn build(self) -> Result<Agent> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let registry = Registry::new();
        let labeller = Arc::new(MemoryNodeLabeller::new());

        // Kubernetes is added first so Slurm wins when both attribute a device
        let mut attributor = Attributor::new();
        if config.exporter.kubernetes_enabled {
            let source = FilePodResources::new(config.scheduler.pod_resources_file.clone());
            attributor.add_backend(Arc::new(
                KubernetesBackend::new(Box::new(source))
                    .with_resource_name(config.scheduler.resource_name.clone())
                    .with_dra_driver(config.scheduler.dra_driver.clone()),
            ));
        }
        let slurm = if config.exporter.slurm_enabled {
            let backend = Arc::new(SlurmBackend::new());
            attributor.add_backend(backend.clone());
            Some(backend)
        } else {
            None
        };

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(FileConnector::new(config.control_plane.snapshot_file.clone())));

        let mut coordinator = Coordinator::new(
            connector,
            config.exporter.clone(),
            registry.clone(),
            labeller.clone(),
        )
        .with_poll_interval(config.poll_interval());

        if !attributor.is_empty() {
            info!("Workload attribution from {:?}", attributor.kinds());
            coordinator = coordinator.with_attributor(Arc::new(attributor));
        }

        if config.exporter.gpu.profiler_enabled {
            let runner = ProcessRunner::new(config.profiler.program.clone(), config.profiler.args.clone());
            coordinator = coordinator.with_profiler(Arc::new(ProfilerExecutor::new(Arc::new(runner))));
        }

        Ok(Agent {
            config,
            registry,
            coordinator: Arc::new(coordinator),
            labeller,
            slurm,
            exporter: None,
            health_addr: None,
            slurm_addr: None,
            services: Vec::new(),
            shutdown_tx: None,
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ControlPlaneDocument;
    use accel_core::mock::mock_gpu;
    use accel_core::DeviceKind;
    use accel_proto::{HealthQueryClient, ListRequest};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(snapshot: &Path) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.exporter.hostname = "node-1".to_string();
        config.control_plane.snapshot_file = snapshot.to_path_buf();
        config.services.metrics.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        config.services.health.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        config.scheduler.slurm_listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        config.agent.poll_interval_seconds = 1;
        config.agent.shutdown_timeout_seconds = 2;
        config
    }

    fn write_snapshot(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("control-plane.json");
        let doc = ControlPlaneDocument {
            devices: vec![mock_gpu(0), mock_gpu(1)],
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        path
    }

    async fn scrape(addr: SocketAddr) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_agent_builder() {
        let agent = AgentBuilder::new().build().await.unwrap();
        assert_eq!(agent.config().agent.name, "accel-exporter");
        assert!(agent.health_addr().is_none());
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let mut config = AgentConfig::default();
        config.agent.poll_interval_seconds = 0;
        let result = AgentBuilder::new().with_config(config).build().await;
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_agent_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(&temp_dir);
        let mut config = test_config(&snapshot);
        config.exporter.slurm_enabled = true;

        let mut agent = AgentBuilder::new().with_config(config).build().await.unwrap();
        agent.start().await.unwrap();
        assert!(agent.slurm_addr().is_some());

        let health_addr = agent.health_addr().unwrap();
        let mut client = HealthQueryClient::connect(format!("http://{}", health_addr))
            .await
            .unwrap();

        // The first poll cycle runs right after start
        let mut states = Vec::new();
        for _ in 0..50 {
            if let Ok(response) = client.list(ListRequest {}).await {
                states = response.into_inner().states;
                if !agent.labeller().labels(DeviceKind::Gpu).await.is_empty() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(states.len(), 2);
        assert_eq!(agent.labeller().labels(DeviceKind::Gpu).await.len(), 2);

        let body = scrape(agent.metrics_addr().unwrap()).await;
        assert!(body.contains("gpu_package_power"));
        assert!(body.contains("hostname=\"node-1\""));

        agent.stop().await.unwrap();
        assert!(agent.health_addr().is_none());
        assert!(!agent.coordinator().is_active().await);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(&temp_dir);
        let mut config = test_config(&snapshot);
        config.services.metrics.enabled = false;
        config.services.health.enabled = false;

        let mut agent = AgentBuilder::new().with_config(config).build().await.unwrap();
        agent.start().await.unwrap();
        assert!(agent.start().await.is_err());
        agent.stop().await.unwrap();
    }
}
