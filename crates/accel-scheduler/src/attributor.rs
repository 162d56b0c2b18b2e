//! Scheduler attributor
//!
//! Queries every enabled back end and merges their device-to-workload maps.
//! Back ends are kept in a fixed priority order (Kubernetes, then Slurm) and
//! merged in that order with last-writer-wins, so when both report the same
//! device key the Slurm record is kept. Back ends key devices differently
//! (bus address, index), so [`Attributor::resolve`] applies the same order
//! when one device matches records under several keys.

use accel_core::{LabelSet, Result, SchedulerBackend, SchedulerKind, WorkloadMap, WorkloadRecord};
use std::sync::Arc;
use tracing::{debug, warn};

fn priority(kind: SchedulerKind) -> u8 {
    match kind {
        SchedulerKind::Kubernetes => 0,
        SchedulerKind::Slurm => 1,
    }
}

/// Composition of zero or more scheduler back ends
#[derive(Default)]
pub struct Attributor {
    backends: Vec<Arc<dyn SchedulerBackend>>,
}

impl Attributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Attributor::add_backend`]
    pub fn with_backend(mut self, backend: Arc<dyn SchedulerBackend>) -> Self {
        self.add_backend(backend);
        self
    }

    /// Register a back end in its priority slot
    pub fn add_backend(&mut self, backend: Arc<dyn SchedulerBackend>) {
        self.backends.push(backend);
        self.backends.sort_by_key(|b| priority(b.kind()));
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Back-end kinds in merge order
    pub fn kinds(&self) -> Vec<SchedulerKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    /// Whether any back end feeds one of the enabled labels
    pub fn check_export_labels(&self, labels: &LabelSet) -> bool {
        self.backends.iter().any(|b| b.check_export_labels(labels))
    }

    /// Merged workloads of every back end.
    ///
    /// A lone back end propagates its error. With several, a failing back
    /// end only loses its own contribution for this call.
    pub async fn list_workloads(&self) -> Result<WorkloadMap> {
        if let [only] = self.backends.as_slice() {
            return only.list_workloads().await;
        }

        let mut merged = WorkloadMap::new();
        for backend in &self.backends {
            match backend.list_workloads().await {
                Ok(workloads) => {
                    debug!("{} back end reported {} workloads", backend.kind(), workloads.len());
                    merged.extend(workloads);
                }
                Err(e) => warn!("{} back end failed to list workloads: {}", backend.kind(), e),
            }
        }
        Ok(merged)
    }

    /// Workload of a device known under several keys; Slurm beats Kubernetes
    pub fn resolve<'a>(workloads: &'a WorkloadMap, keys: &[&str]) -> Option<&'a WorkloadRecord> {
        keys.iter()
            .filter_map(|key| workloads.get(*key))
            .max_by_key(|record| priority(record.scheduler))
    }

    /// Close every back end, logging failures
    pub async fn close(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.close().await {
                warn!("Failed to close {} back end: {}", backend.kind(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_core::{Error, LabelName, WorkloadInfo};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticBackend {
        kind: SchedulerKind,
        workloads: Option<WorkloadMap>,
        calls: AtomicUsize,
    }

    impl StaticBackend {
        fn new(kind: SchedulerKind, entries: &[(&str, &str)]) -> Arc<Self> {
            let workloads = entries
                .iter()
                .map(|(key, job)| (key.to_string(), job_record(kind, job)))
                .collect();
            Arc::new(Self {
                kind,
                workloads: Some(workloads),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(kind: SchedulerKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                workloads: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SchedulerBackend for StaticBackend {
        fn kind(&self) -> SchedulerKind {
            self.kind
        }

        async fn list_workloads(&self) -> Result<WorkloadMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.workloads
                .clone()
                .ok_or_else(|| Error::scheduler("back end offline"))
        }

        fn check_export_labels(&self, labels: &LabelSet) -> bool {
            labels.contains(LabelName::JobId)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn job_record(kind: SchedulerKind, job: &str) -> WorkloadRecord {
        WorkloadRecord {
            scheduler: kind,
            info: WorkloadInfo::Job {
                job_id: job.to_string(),
                user: "alice".to_string(),
                partition: "gpu".to_string(),
                cluster: "c1".to_string(),
            },
        }
    }

    fn job_id(record: &WorkloadRecord) -> &str {
        match &record.info {
            WorkloadInfo::Job { job_id, .. } => job_id,
            WorkloadInfo::Pod { pod, .. } => pod,
        }
    }

    #[tokio::test]
    async fn test_workload_merge_order() {
        // Registered in reverse priority order on purpose
        let attributor = Attributor::new()
            .with_backend(StaticBackend::new(SchedulerKind::Slurm, &[("gpu0", "jobY"), ("gpu1", "jobZ")]))
            .with_backend(StaticBackend::new(SchedulerKind::Kubernetes, &[("gpu0", "jobX")]));
        assert_eq!(attributor.kinds(), vec![SchedulerKind::Kubernetes, SchedulerKind::Slurm]);

        let merged = attributor.list_workloads().await.unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(job_id(&merged["gpu1"]), "jobZ");
        assert_eq!(job_id(&merged["gpu0"]), "jobY");
        assert_eq!(merged["gpu0"].scheduler, SchedulerKind::Slurm);
    }

    #[test]
    fn test_resolve_across_key_spaces() {
        let mut workloads = WorkloadMap::new();
        workloads.insert("0000:03:00.0".to_string(), job_record(SchedulerKind::Kubernetes, "podX"));
        workloads.insert("0".to_string(), job_record(SchedulerKind::Slurm, "jobY"));
        workloads.insert("0000:04:00.0".to_string(), job_record(SchedulerKind::Kubernetes, "podZ"));

        // Bus address listed first still loses to the Slurm record
        let record = Attributor::resolve(&workloads, &["0000:03:00.0", "0"]).unwrap();
        assert_eq!(job_id(record), "jobY");
        let record = Attributor::resolve(&workloads, &["0", "0000:03:00.0"]).unwrap();
        assert_eq!(job_id(record), "jobY");

        let record = Attributor::resolve(&workloads, &["0000:04:00.0", "1"]).unwrap();
        assert_eq!(job_id(record), "podZ");
        assert!(Attributor::resolve(&workloads, &["0000:05:00.0", "2"]).is_none());
    }

    #[tokio::test]
    async fn test_single_backend_error_propagates() {
        let attributor = Attributor::new().with_backend(StaticBackend::failing(SchedulerKind::Slurm));
        assert!(attributor.list_workloads().await.is_err());
    }

    #[tokio::test]
    async fn test_failing_backend_is_skipped_among_several() {
        let good = StaticBackend::new(SchedulerKind::Slurm, &[("3", "job42")]);
        let bad = StaticBackend::failing(SchedulerKind::Kubernetes);
        let attributor = Attributor::new()
            .with_backend(bad.clone())
            .with_backend(good.clone());

        let merged = attributor.list_workloads().await.unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(job_id(&merged["3"]), "job42");
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_attributor() {
        let attributor = Attributor::new();
        assert!(attributor.list_workloads().await.unwrap().is_empty());

        let labels = LabelSet::resolve(&[LabelName::JobId], &[], &BTreeMap::new());
        assert!(!attributor.check_export_labels(&labels));

        let attributor = attributor.with_backend(StaticBackend::new(SchedulerKind::Slurm, &[]));
        assert!(attributor.check_export_labels(&labels));
    }
}
