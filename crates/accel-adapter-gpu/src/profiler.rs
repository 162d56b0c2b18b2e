//! Circuit-breaking executor for the external profiler
//!
//! The profiler is a separate process that occasionally crashes under
//! hardware stress. Calls go through a breaker with three states:
//!
//! - `Closed`: no recent failures
//! - `Degraded`: some consecutive ordinary failures, below the threshold
//! - `Open`: threshold reached, or a fatal crash was seen
//!
//! In `Open` calls fail fast without launching the process. Any success
//! resets the failure counter. A fatal failure (crash signatures in the
//! failure message) is sticky for the lifetime of the executor; `reset()`
//! only clears the ordinary counter.
//!
//! The breaker check and the launch are serialized, so concurrent callers
//! observe the outcome of an in-flight invocation before deciding to start
//! another one.

use crate::{GpuError, Result};
use accel_core::SnapshotCache;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// TTL of cached profiler results
pub const PROFILER_CACHE_TTL: Duration = Duration::from_secs(10);

/// Deadline of one profiler invocation
pub const PROFILER_TIMEOUT: Duration = Duration::from_secs(15);

/// Consecutive ordinary failures that open the breaker
pub const BREAKER_THRESHOLD: u32 = 3;

/// Failure signatures of a crashed profiler
const FATAL_MARKERS: [&str; 3] = ["core dumped", "Aborted", "Segmentation fault"];

/// Profiler output document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerReport {
    #[serde(default)]
    pub gpu_metrics: Vec<NodeMetrics>,
}

/// Counters of one logical node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub logical_node_id: u32,

    #[serde(default)]
    pub metrics: Vec<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: String,
    pub value: f64,
}

impl ProfilerReport {
    /// Counters keyed by logical node id, then field name
    pub fn by_node(&self) -> BTreeMap<u32, BTreeMap<String, f64>> {
        self.gpu_metrics
            .iter()
            .map(|node| {
                let fields = node
                    .metrics
                    .iter()
                    .map(|m| (m.field.clone(), m.value))
                    .collect();
                (node.logical_node_id, fields)
            })
            .collect()
    }
}

/// Runs the profiler once and returns its stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self) -> Result<Vec<u8>>;
}

/// Runs the profiler as a child process
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self) -> Result<Vec<u8>> {
        debug!("Running profiler: {} {:?}", self.program, self.args);
        // Dropped on timeout by the caller; the child must not outlive it
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut message = format!("{} exited with {}: {}", self.program, output.status, stderr.trim());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            match output.status.signal() {
                Some(6) => message.push_str(" (Aborted)"),
                Some(11) => message.push_str(" (Segmentation fault)"),
                _ => {}
            }
            if output.status.core_dumped() {
                message.push_str(" (core dumped)");
            }
        }
        Err(GpuError::ProfilerFailed(message))
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Degraded,
    Open,
}

/// Profiler client guarded by a circuit breaker and a result cache
pub struct ProfilerExecutor {
    runner: Arc<dyn CommandRunner>,
    cache: SnapshotCache<ProfilerReport>,
    launch: Mutex<()>,
    failures: AtomicU32,
    fatal: AtomicBool,
    threshold: u32,
}

impl ProfilerExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_limits(runner, PROFILER_CACHE_TTL, PROFILER_TIMEOUT, BREAKER_THRESHOLD)
    }

    pub fn with_limits(
        runner: Arc<dyn CommandRunner>,
        ttl: Duration,
        timeout: Duration,
        threshold: u32,
    ) -> Self {
        Self {
            runner,
            cache: SnapshotCache::with_ttl("profiler", ttl, timeout),
            launch: Mutex::new(()),
            failures: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
            threshold,
        }
    }

    pub fn state(&self) -> BreakerState {
        let failures = self.failures.load(Ordering::SeqCst);
        if self.fatal.load(Ordering::SeqCst) || failures >= self.threshold {
            BreakerState::Open
        } else if failures > 0 {
            BreakerState::Degraded
        } else {
            BreakerState::Closed
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Clear the ordinary failure counter; a fatal lockout stays
    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Latest profiler report, from cache when fresh
    pub async fn get_metrics(&self) -> Result<Arc<ProfilerReport>> {
        // Held until the failure accounting below is done
        let _launch = self.launch.lock().await;

        if self.is_fatal() {
            return Err(GpuError::BreakerOpen(
                "profiler crashed earlier in this session".to_string(),
            ));
        }
        let failures = self.consecutive_failures();
        if failures >= self.threshold {
            return Err(GpuError::BreakerOpen(format!(
                "{} consecutive failures",
                failures
            )));
        }

        let runner = &self.runner;
        let outcome = self
            .cache
            .read(move || async move {
                let stdout = runner.run().await?;
                let report: ProfilerReport =
                    serde_json::from_slice(&stdout).map_err(GpuError::from)?;
                Ok::<_, accel_core::Error>(report)
            })
            .await;

        match outcome {
            Ok(report) => {
                if self.failures.swap(0, Ordering::SeqCst) > 0 {
                    info!("Profiler recovered");
                }
                Ok(report)
            }
            Err(e) => {
                let message = e.to_string();
                if FATAL_MARKERS.iter().any(|marker| message.contains(marker)) {
                    self.fatal.store(true, Ordering::SeqCst);
                    error!("Profiler crashed, disabling it for this session: {}", message);
                    return Err(GpuError::ProfilerCrashed(message));
                }
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("Profiler failure {}/{}: {}", failures, self.threshold, message);
                if matches!(e, accel_core::Error::Timeout(_)) {
                    return Err(GpuError::Timeout(self.cache.fetch_timeout()));
                }
                Err(GpuError::ProfilerFailed(message))
            }
        }
    }
}
