//! Prometheus metrics exporter implementation

use crate::{MetricsError, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Hook invoked before every scrape is encoded.
///
/// Implementations refresh whatever feeds the registry. Failures are theirs
/// to log; the scrape then serves the values the gauges already hold.
#[async_trait]
pub trait ScrapeSource: Send + Sync {
    async fn refresh(&self);
}

#[derive(Clone)]
struct AppState {
    registry: Registry,
    source: Option<Arc<dyn ScrapeSource>>,
}

/// Prometheus metrics exporter
pub struct PrometheusExporter {
    registry: Registry,
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    source: Option<Arc<dyn ScrapeSource>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter with its own registry
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self::with_registry(bind_addr, Registry::new())
    }

    /// Create an exporter serving an existing registry
    pub fn with_registry(bind_addr: SocketAddr, registry: Registry) -> Self {
        Self {
            registry,
            bind_addr,
            local_addr: None,
            source: None,
            server_handle: None,
        }
    }

    /// Install the hook run before each scrape
    pub fn set_scrape_source(&mut self, source: Arc<dyn ScrapeSource>) {
        self.source = Some(source);
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start the HTTP server for metrics endpoint
    pub async fn start_server(&mut self) -> Result<()> {
        if self.server_handle.is_some() {
            return Err(MetricsError::Config("Server already started".to_string()));
        }

        let app = create_metrics_app(AppState {
            registry: self.registry.clone(),
            source: self.source.clone(),
        });
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!("Starting Prometheus metrics server on {}", local_addr);

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Prometheus metrics server error: {}", e);
            }
        });

        self.local_addr = Some(local_addr);
        self.server_handle = Some(server_handle);
        Ok(())
    }

    /// Stop the HTTP server
    pub async fn stop_server(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.local_addr = None;
    }

    /// Export metrics as Prometheus text format
    pub fn export_metrics(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get metrics endpoint URL
    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.local_addr.unwrap_or(self.bind_addr))
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.server_handle.is_some()
    }
}

impl Drop for PrometheusExporter {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| MetricsError::Export(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| MetricsError::Export(format!("Failed to convert metrics to string: {}", e)))
}

/// Create the Axum app for metrics endpoint
fn create_metrics_app(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Response {
    if let Some(source) = &state.source {
        source.refresh().await;
    }

    match encode(&state.registry) {
        Ok(metrics_text) => (
            StatusCode::OK,
            [("content-type", TextEncoder::new().format_type().to_string())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode Prometheus metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Handler for /health endpoint
async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}
