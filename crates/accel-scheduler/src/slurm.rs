//! Slurm job back end
//!
//! Job start/end notifications arrive out of band, either as JSON datagrams
//! from the prolog/epilog hooks or through an in-process channel. Listener
//! tasks update an index-keyed job table; `list_workloads` only reads it.

use crate::{Result as SchedulerResult, SchedulerError};
use accel_core::{
    LabelName, LabelSet, Result, SchedulerBackend, SchedulerKind, WorkloadInfo, WorkloadMap,
    WorkloadRecord,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Pause after the first failed receive; doubles up to `RECV_BACKOFF_MAX`
const RECV_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Job lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobNotification {
    Start {
        job_id: String,
        #[serde(default)]
        user: String,
        #[serde(default)]
        partition: String,
        #[serde(default)]
        cluster: String,
        gpus: Vec<u32>,
    },
    End {
        job_id: String,
        /// GPUs released; empty releases every GPU of the job
        #[serde(default)]
        gpus: Vec<u32>,
    },
}

type JobTable = Arc<RwLock<BTreeMap<u32, WorkloadRecord>>>;

/// Slurm back end keyed by GPU index
#[derive(Default)]
pub struct SlurmBackend {
    jobs: JobTable,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl SlurmBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one notification to the job table
    pub async fn apply(&self, notification: JobNotification) {
        apply(&self.jobs, notification).await;
    }

    /// Feed notifications from an in-process channel
    pub async fn spawn_channel_listener(&self, mut rx: mpsc::Receiver<JobNotification>) {
        let jobs = Arc::clone(&self.jobs);
        let handle = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                apply(&jobs, notification).await;
            }
            debug!("Slurm notification channel closed");
        });
        self.listeners.lock().await.push(handle);
    }

    /// Bind a UDP socket and feed notifications from its datagrams
    pub async fn bind_udp(&self, addr: SocketAddr) -> SchedulerResult<SocketAddr> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SchedulerError::Listener(format!("bind {}: {}", addr, e)))?;
        let local_addr = socket.local_addr()?;
        info!("Listening for Slurm job notifications on {}", local_addr);

        let handle = tokio::spawn(receive_loop(socket, Arc::clone(&self.jobs)));
        self.listeners.lock().await.push(handle);
        Ok(local_addr)
    }
}

/// Datagram socket the listener reads from
#[async_trait]
trait DatagramSource: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramSource for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

async fn receive_loop<S: DatagramSource>(source: S, jobs: JobTable) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut backoff = RECV_BACKOFF_MIN;
    loop {
        let (len, peer) = match source.recv_from(&mut buf).await {
            Ok(received) => {
                backoff = RECV_BACKOFF_MIN;
                received
            }
            Err(e) => {
                warn!("Slurm listener receive failed, retrying in {:?}: {}", backoff, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECV_BACKOFF_MAX);
                continue;
            }
        };
        match parse_notification(&buf[..len]) {
            Ok(notification) => apply(&jobs, notification).await,
            Err(e) => warn!("Dropping notification from {}: {}", peer, e),
        }
    }
}

/// Decode one JSON notification
pub fn parse_notification(bytes: &[u8]) -> SchedulerResult<JobNotification> {
    let notification: JobNotification = serde_json::from_slice(bytes)?;
    let job_id = match &notification {
        JobNotification::Start { job_id, .. } | JobNotification::End { job_id, .. } => job_id,
    };
    if job_id.is_empty() {
        return Err(SchedulerError::InvalidNotification("empty job_id".to_string()));
    }
    Ok(notification)
}

async fn apply(jobs: &RwLock<BTreeMap<u32, WorkloadRecord>>, notification: JobNotification) {
    let mut jobs = jobs.write().await;
    match notification {
        JobNotification::Start {
            job_id,
            user,
            partition,
            cluster,
            gpus,
        } => {
            info!("Slurm job {} started on GPUs {:?}", job_id, gpus);
            for gpu in gpus {
                jobs.insert(
                    gpu,
                    WorkloadRecord {
                        scheduler: SchedulerKind::Slurm,
                        info: WorkloadInfo::Job {
                            job_id: job_id.clone(),
                            user: user.clone(),
                            partition: partition.clone(),
                            cluster: cluster.clone(),
                        },
                    },
                );
            }
        }
        JobNotification::End { job_id, gpus } => {
            info!("Slurm job {} ended", job_id);
            jobs.retain(|gpu, record| {
                let owned = matches!(&record.info, WorkloadInfo::Job { job_id: id, .. } if *id == job_id);
                !(owned && (gpus.is_empty() || gpus.contains(gpu)))
            });
        }
    }
}

#[async_trait]
impl SchedulerBackend for SlurmBackend {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    async fn list_workloads(&self) -> Result<WorkloadMap> {
        Ok(self
            .jobs
            .read()
            .await
            .iter()
            .map(|(gpu, record)| (gpu.to_string(), record.clone()))
            .collect())
    }

    fn check_export_labels(&self, labels: &LabelSet) -> bool {
        [
            LabelName::JobId,
            LabelName::JobUser,
            LabelName::JobPartition,
            LabelName::ClusterName,
        ]
        .into_iter()
        .any(|l| labels.contains(l))
    }

    async fn close(&self) -> Result<()> {
        for handle in self.listeners.lock().await.drain(..) {
            handle.abort();
        }
        self.jobs.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start(job_id: &str, gpus: Vec<u32>) -> JobNotification {
        JobNotification::Start {
            job_id: job_id.to_string(),
            user: "alice".to_string(),
            partition: "mi300".to_string(),
            cluster: "frontier".to_string(),
            gpus,
        }
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let backend = SlurmBackend::new();
        backend.apply(start("101", vec![0, 1])).await;
        backend.apply(start("102", vec![2])).await;

        let workloads = backend.list_workloads().await.unwrap();
        assert_eq!(workloads.len(), 3);
        assert_eq!(workloads["1"].labels()[0], ("job_id", "101".to_string()));

        backend
            .apply(JobNotification::End {
                job_id: "101".to_string(),
                gpus: vec![1],
            })
            .await;
        let workloads = backend.list_workloads().await.unwrap();
        assert!(workloads.contains_key("0"));
        assert!(!workloads.contains_key("1"));

        backend
            .apply(JobNotification::End {
                job_id: "101".to_string(),
                gpus: Vec::new(),
            })
            .await;
        let workloads = backend.list_workloads().await.unwrap();
        assert_eq!(workloads.keys().collect::<Vec<_>>(), vec!["2"]);
    }

    #[tokio::test]
    async fn test_end_of_other_job_keeps_reassigned_gpu() {
        let backend = SlurmBackend::new();
        backend.apply(start("101", vec![0])).await;
        backend.apply(start("102", vec![0])).await;
        backend
            .apply(JobNotification::End {
                job_id: "101".to_string(),
                gpus: Vec::new(),
            })
            .await;
        let workloads = backend.list_workloads().await.unwrap();
        assert_eq!(workloads["0"].labels()[0].1, "102");
    }

    #[test]
    fn test_parse_notification() {
        let n = parse_notification(br#"{"event":"start","job_id":"7","gpus":[3]}"#).unwrap();
        assert_eq!(
            n,
            JobNotification::Start {
                job_id: "7".to_string(),
                user: String::new(),
                partition: String::new(),
                cluster: String::new(),
                gpus: vec![3],
            }
        );
        assert!(parse_notification(br#"{"event":"end","job_id":""}"#).is_err());
        assert!(parse_notification(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let backend = SlurmBackend::new();
        let (tx, rx) = mpsc::channel(8);
        backend.spawn_channel_listener(rx).await;

        tx.send(start("55", vec![4])).await.unwrap();
        drop(tx);

        for _ in 0..50 {
            if !backend.list_workloads().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.list_workloads().await.unwrap().contains_key("4"));
    }

    /// Replays receive outcomes, then fails forever
    struct ScriptedSource {
        script: std::sync::Mutex<VecDeque<&'static [u8]>>,
        attempts: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(script: Vec<&'static [u8]>) -> (Self, Arc<AtomicUsize>) {
            let attempts = Arc::new(AtomicUsize::new(0));
            let source = Self {
                script: std::sync::Mutex::new(script.into()),
                attempts: Arc::clone(&attempts),
            };
            (source, attempts)
        }
    }

    #[async_trait]
    impl DatagramSource for ScriptedSource {
        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(datagram) if !datagram.is_empty() => {
                    buf[..datagram.len()].copy_from_slice(datagram);
                    Ok((datagram.len(), "127.0.0.1:9".parse().unwrap()))
                }
                _ => Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_errors_back_off() {
        let (source, attempts) = ScriptedSource::new(Vec::new());
        let handle = tokio::spawn(receive_loop(source, JobTable::default()));

        // Retries at 0, 0.1, 0.3, 0.7, 1.5, 3.1 and 6.3 seconds
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.abort();
        let attempts = attempts.load(Ordering::SeqCst);
        assert!((6..=8).contains(&attempts), "{} receive attempts", attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_recovers_after_receive_errors() {
        let (source, _) = ScriptedSource::new(vec![
            &b""[..],
            &b""[..],
            &br#"{"event":"start","job_id":"77","gpus":[2]}"#[..],
        ]);
        let jobs = JobTable::default();
        let handle = tokio::spawn(receive_loop(source, Arc::clone(&jobs)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.abort();
        assert!(jobs.read().await.contains_key(&2));
    }

    #[tokio::test]
    async fn test_udp_listener() {
        let backend = SlurmBackend::new();
        let addr = backend.bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", addr).await.unwrap();
        sender
            .send_to(br#"{"event":"start","job_id":"9","user":"bob","gpus":[1]}"#, addr)
            .await
            .unwrap();

        for _ in 0..100 {
            if !backend.list_workloads().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let workloads = backend.list_workloads().await.unwrap();
        assert_eq!(workloads["1"].labels()[1], ("job_user", "bob".to_string()));

        backend.close().await.unwrap();
        assert!(backend.list_workloads().await.unwrap().is_empty());
    }
}
