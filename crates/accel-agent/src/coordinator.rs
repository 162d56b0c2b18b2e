//! Agent coordinator
//!
//! Owns the control-plane connection and the device clients built on top of
//! it. A fixed-period loop reconnects when the session is not usable, runs
//! health evaluation for health-aware clients, and publishes node labels.
//!
//! A failed evaluation marks the session stale. The next tick reconnects and
//! only then replaces the clients, so the gauges of the old clients keep
//! serving their last values while the control plane is unreachable.
//!
//! GPU overrides and verdicts live in a store owned here, so they survive
//! client replacement. The session lock is only taken for the final swap;
//! readers never wait on control-plane calls made during a reconnect.

use crate::connector::Connector;
use crate::node_labeller::health_labels;
use accel_adapter_gpu::{GpuClient, ProfilerExecutor, SharedHealth};
use accel_adapter_nic::NicClient;
use accel_core::{
    ControlPlaneClient, DeviceClient, DeviceKind, ExporterConfig, NodeLabeller, Result,
};
use accel_metrics::ScrapeSource;
use accel_scheduler::Attributor;
use async_trait::async_trait;
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default period of the poll loop
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Session {
    control_plane: Option<Arc<dyn ControlPlaneClient>>,
    clients: Vec<Arc<dyn DeviceClient>>,
    stale: bool,
}

impl Session {
    fn is_active(&self) -> bool {
        let connected = self
            .control_plane
            .as_ref()
            .map(|cp| cp.is_connected())
            .unwrap_or(false);
        connected && !self.stale && !self.clients.is_empty() && self.clients.iter().all(|c| c.is_active())
    }

    async fn teardown(&mut self) {
        for client in self.clients.drain(..) {
            if let Err(e) = client.close().await {
                warn!("Failed to close {} client: {}", client.kind(), e);
            }
        }
        if let Some(control_plane) = self.control_plane.take() {
            close_control_plane(control_plane).await;
        }
        self.stale = false;
    }
}

async fn close_control_plane(control_plane: Arc<dyn ControlPlaneClient>) {
    if let Err(e) = control_plane.close().await {
        warn!("Failed to close control-plane connection: {}", e);
    }
}

/// Drives the device clients of one node
pub struct Coordinator {
    connector: Arc<dyn Connector>,
    config: ExporterConfig,
    registry: Registry,
    labeller: Arc<dyn NodeLabeller>,
    profiler: Option<Arc<ProfilerExecutor>>,
    attributor: Option<Arc<Attributor>>,
    poll_interval: Duration,
    health: Arc<SharedHealth>,
    session: RwLock<Session>,
    reconnecting: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ExporterConfig,
        registry: Registry,
        labeller: Arc<dyn NodeLabeller>,
    ) -> Self {
        Self {
            connector,
            config,
            registry,
            labeller,
            profiler: None,
            attributor: None,
            poll_interval: POLL_INTERVAL,
            health: Arc::new(SharedHealth::new()),
            session: RwLock::new(Session::default()),
            reconnecting: Mutex::new(()),
        }
    }

    pub fn with_profiler(mut self, profiler: Arc<ProfilerExecutor>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn with_attributor(mut self, attributor: Arc<Attributor>) -> Self {
        self.attributor = Some(attributor);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether the connection and every device client are usable
    pub async fn is_active(&self) -> bool {
        self.session.read().await.is_active()
    }

    /// Current device clients
    pub async fn clients(&self) -> Vec<Arc<dyn DeviceClient>> {
        self.session.read().await.clients.clone()
    }

    /// Current client of one device kind
    pub async fn client(&self, kind: DeviceKind) -> Option<Arc<dyn DeviceClient>> {
        self.session
            .read()
            .await
            .clients
            .iter()
            .find(|c| c.kind() == kind)
            .cloned()
    }

    fn build_clients(&self, control_plane: &Arc<dyn ControlPlaneClient>) -> Vec<Arc<dyn DeviceClient>> {
        let mut clients: Vec<Arc<dyn DeviceClient>> = Vec::new();

        if self.config.gpu.enabled {
            let mut gpu = GpuClient::new(Arc::clone(control_plane), self.registry.clone())
                .with_shared_health(Arc::clone(&self.health));
            if let Some(profiler) = &self.profiler {
                gpu = gpu.with_profiler(Arc::clone(profiler));
            }
            if let Some(attributor) = &self.attributor {
                gpu = gpu.with_attributor(Arc::clone(attributor));
            }
            clients.push(Arc::new(gpu));
        }

        if self.config.nic.enabled {
            clients.push(Arc::new(NicClient::new(
                Arc::clone(control_plane),
                self.registry.clone(),
            )));
        }

        clients
    }

    /// Replace the connection and every device client.
    ///
    /// The previous session is only torn down once a new connection exists.
    /// Its clients are closed first so their gauges leave the registry, but
    /// stay visible to readers until the new clients are swapped in.
    pub async fn reconnect(&self) -> Result<()> {
        let _reconnecting = self.reconnecting.lock().await;
        let control_plane = self.connector.connect().await?;

        for client in self.clients().await {
            if let Err(e) = client.close().await {
                warn!("Failed to close {} client: {}", client.kind(), e);
            }
        }

        let clients = self.build_clients(&control_plane);
        for client in &clients {
            if let Err(e) = client.init_configs(&self.config).await {
                warn!("Failed to configure {} client: {}", client.kind(), e);
                for client in &clients {
                    let _ = client.close().await;
                }
                close_control_plane(control_plane).await;
                let previous = std::mem::take(&mut *self.session.write().await);
                if let Some(control_plane) = previous.control_plane {
                    close_control_plane(control_plane).await;
                }
                return Err(e);
            }
        }

        for client in &clients {
            if let Err(e) = client.update_static_metrics().await {
                warn!("Failed to populate static {} metrics: {}", client.kind(), e);
            }
        }

        // Fresh clients get a fresh ordinary-failure budget
        if let Some(profiler) = &self.profiler {
            profiler.reset();
        }

        info!("Connected to control plane with {} device clients", clients.len());
        let previous = std::mem::replace(
            &mut *self.session.write().await,
            Session {
                control_plane: Some(control_plane),
                clients,
                stale: false,
            },
        );
        if let Some(control_plane) = previous.control_plane {
            close_control_plane(control_plane).await;
        }
        Ok(())
    }

    /// One poll cycle
    pub async fn tick(&self) {
        if !self.is_active().await {
            if let Err(e) = self.reconnect().await {
                warn!("Reconnect failed, skipping this cycle: {}", e);
                return;
            }
        }

        let mut failed = false;
        for client in self.clients().await {
            let kind = client.kind();
            if !kind.is_health_aware() {
                continue;
            }
            if let Err(e) = client.process_health_validation().await {
                warn!("{} health evaluation failed: {}", kind, e);
                failed = true;
                continue;
            }
            if let Some(states) = client.get_health_states().await {
                if let Err(e) = self.labeller.publish(kind, health_labels(kind, &states)).await {
                    warn!("Failed to publish {} node labels: {}", kind, e);
                }
            }
        }

        if failed {
            debug!("Marking control-plane session stale");
            self.session.write().await.stale = true;
        }
    }

    /// Run the poll loop until `shutdown` flips to true or its sender drops
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Starting poll loop every {:?}", self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Poll loop stopped");
        self.close().await;
    }

    /// Close every device client, the connection and the scheduler back ends
    pub async fn close(&self) {
        self.session.write().await.teardown().await;
        if let Some(attributor) = &self.attributor {
            attributor.close().await;
        }
    }
}

#[async_trait]
impl ScrapeSource for Coordinator {
    async fn refresh(&self) {
        for client in self.clients().await {
            if let Err(e) = client.update_metrics_stats().await {
                warn!("Failed to refresh {} metrics: {}", client.kind(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_labeller::MemoryNodeLabeller;
    use accel_core::devices::{
        CperRecordList, DeviceList, EventList, EventSeverity, NicDeviceList, NicPortList,
        NicStationList,
    };
    use accel_core::mock::{mock_gpu, MockControlPlane, MockFailure};
    use accel_core::{Error, HealthVerdict};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Hands out a fresh two-GPU mock per connection
    #[derive(Default)]
    struct MockConnector {
        connects: AtomicUsize,
        refuse: AtomicBool,
        failing_status: AtomicBool,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<Arc<dyn ControlPlaneClient>> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::transport("connection refused"));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            let mock = MockControlPlane::with_gpus(2);
            if self.failing_status.load(Ordering::SeqCst) {
                mock.set_failure(Some(MockFailure::Status(3))).await;
            }
            Ok(Arc::new(mock))
        }
    }

    /// Device listing waits for permits on a shared gate
    struct GatedControlPlane {
        inner: MockControlPlane,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ControlPlaneClient for GatedControlPlane {
        async fn get_devices(&self) -> Result<DeviceList> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| Error::transport(e.to_string()))?;
            self.inner.get_devices().await
        }

        async fn get_events(&self, severity: EventSeverity) -> Result<EventList> {
            self.inner.get_events(severity).await
        }

        async fn get_vendor_error_records(&self, severity: EventSeverity) -> Result<CperRecordList> {
            self.inner.get_vendor_error_records(severity).await
        }

        async fn get_nic_devices(&self) -> Result<NicDeviceList> {
            self.inner.get_nic_devices().await
        }

        async fn get_nic_stations(&self) -> Result<NicStationList> {
            self.inner.get_nic_stations().await
        }

        async fn get_nic_ports(&self) -> Result<NicPortList> {
            self.inner.get_nic_ports().await
        }
    }

    struct GatedConnector {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(&self) -> Result<Arc<dyn ControlPlaneClient>> {
            Ok(Arc::new(GatedControlPlane {
                inner: MockControlPlane::with_gpus(2),
                gate: Arc::clone(&self.gate),
            }))
        }
    }

    fn coordinator(connector: Arc<dyn Connector>, labeller: Arc<MemoryNodeLabeller>) -> (Coordinator, Registry) {
        let registry = Registry::new();
        let mut config = ExporterConfig::default();
        config.hostname = "node-1".to_string();
        config.nic.enabled = true;
        let coordinator = Coordinator::new(connector, config, registry.clone(), labeller)
            .with_poll_interval(Duration::from_millis(10));
        (coordinator, registry)
    }

    #[tokio::test]
    async fn test_tick_connects_and_publishes_labels() {
        let connector = Arc::new(MockConnector::default());
        let labeller = Arc::new(MemoryNodeLabeller::new());
        let (coordinator, _) = coordinator(connector.clone(), labeller.clone());

        coordinator.tick().await;
        assert!(coordinator.is_active().await);
        assert_eq!(coordinator.clients().await.len(), 2);

        let labels = labeller.labels(DeviceKind::Gpu).await;
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["gpu.health.1"], "healthy");
        assert!(labeller.labels(DeviceKind::Nic).await.is_empty());

        coordinator.tick().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_skips_cycle() {
        let connector = Arc::new(MockConnector::default());
        connector.refuse.store(true, Ordering::SeqCst);
        let labeller = Arc::new(MemoryNodeLabeller::new());
        let (coordinator, _) = coordinator(connector.clone(), labeller.clone());

        coordinator.tick().await;
        assert!(!coordinator.is_active().await);
        assert!(labeller.all().await.is_empty());

        connector.refuse.store(false, Ordering::SeqCst);
        coordinator.tick().await;
        assert!(coordinator.is_active().await);
    }

    #[tokio::test]
    async fn test_failed_evaluation_reconnects_next_tick() {
        let connector = Arc::new(MockConnector::default());
        connector.failing_status.store(true, Ordering::SeqCst);
        let labeller = Arc::new(MemoryNodeLabeller::new());
        let (coordinator, _) = coordinator(connector.clone(), labeller.clone());

        coordinator.tick().await;
        assert!(!coordinator.is_active().await);
        assert!(labeller.all().await.is_empty());
        // Stale clients stay around until a new connection exists
        assert_eq!(coordinator.clients().await.len(), 2);

        connector.failing_status.store(false, Ordering::SeqCst);
        coordinator.tick().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert!(coordinator.is_active().await);
        assert_eq!(labeller.labels(DeviceKind::Gpu).await.len(), 2);
    }

    #[tokio::test]
    async fn test_scrape_refresh_updates_gauges() {
        let connector = Arc::new(MockConnector::default());
        let (coordinator, registry) = coordinator(connector, Arc::new(MemoryNodeLabeller::new()));
        coordinator.tick().await;
        coordinator.refresh().await;

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"gpu_package_power".to_string()));
        assert!(names.contains(&"gpu_health".to_string()));
        assert!(names.contains(&"gpu_nodes_total".to_string()));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let connector = Arc::new(MockConnector::default());
        let (coordinator, registry) = coordinator(connector, Arc::new(MemoryNodeLabeller::new()));
        let coordinator = Arc::new(coordinator);
        let (tx, rx) = watch::channel(false);

        let running = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move { running.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.is_active().await);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator.clients().await.is_empty());
        assert!(registry.gather().is_empty());
    }

    #[tokio::test]
    async fn test_overrides_survive_reconnect() {
        let connector = Arc::new(MockConnector::default());
        let labeller = Arc::new(MemoryNodeLabeller::new());
        let (coordinator, _) = coordinator(connector.clone(), labeller.clone());
        let id = mock_gpu(0).id();

        coordinator.tick().await;
        let gpu = coordinator.client(DeviceKind::Gpu).await.unwrap();
        gpu.set_health_override(&id, "unhealthy").await.unwrap();

        coordinator.reconnect().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        // The new client answers with the last verdicts before evaluating
        let gpu = coordinator.client(DeviceKind::Gpu).await.unwrap();
        assert_eq!(gpu.get_health_states().await.unwrap()[&id].verdict, HealthVerdict::Unhealthy);

        coordinator.tick().await;
        assert_eq!(gpu.get_health_states().await.unwrap()[&id].verdict, HealthVerdict::Unhealthy);
        assert_eq!(labeller.labels(DeviceKind::Gpu).await["gpu.health.0"], "unhealthy");
    }

    #[tokio::test]
    async fn test_reconnect_does_not_block_readers() {
        let gate = Arc::new(Semaphore::new(1));
        let connector = Arc::new(GatedConnector { gate: gate.clone() });
        let (coordinator, _) = coordinator(connector, Arc::new(MemoryNodeLabeller::new()));
        let coordinator = Arc::new(coordinator);
        coordinator.tick().await;
        assert!(coordinator.is_active().await);

        // Device listing of the next connection blocks until released
        let held = gate.acquire().await.unwrap();
        let reconnecting = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move { reconnecting.reconnect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        let clients = tokio::time::timeout(Duration::from_millis(100), coordinator.clients())
            .await
            .unwrap();
        assert_eq!(clients.len(), 2);
        let gpu = tokio::time::timeout(Duration::from_millis(100), coordinator.client(DeviceKind::Gpu))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gpu.get_health_states().await.unwrap().len(), 2);

        drop(held);
        handle.await.unwrap().unwrap();
        assert!(coordinator.is_active().await);
        assert_eq!(coordinator.clients().await.len(), 2);
    }
}
