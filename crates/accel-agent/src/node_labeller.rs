//! Node health labels

use accel_core::{DeviceKind, HealthStates, NodeLabeller, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::info;

/// `<kind>.health.<index>` = verdict, one entry per evaluated device
pub fn health_labels(kind: DeviceKind, states: &HealthStates) -> BTreeMap<String, String> {
    states
        .values()
        .map(|state| {
            (
                format!("{}.health.{}", kind, state.index),
                state.verdict.as_str().to_string(),
            )
        })
        .collect()
}

/// Keeps the published labels in memory and logs every change
#[derive(Debug, Default)]
pub struct MemoryNodeLabeller {
    labels: RwLock<HashMap<DeviceKind, BTreeMap<String, String>>>,
}

impl MemoryNodeLabeller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels currently published for one device kind
    pub async fn labels(&self, kind: DeviceKind) -> BTreeMap<String, String> {
        self.labels.read().await.get(&kind).cloned().unwrap_or_default()
    }

    /// Every published label
    pub async fn all(&self) -> BTreeMap<String, String> {
        self.labels
            .read()
            .await
            .values()
            .flat_map(|labels| labels.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

#[async_trait]
impl NodeLabeller for MemoryNodeLabeller {
    async fn publish(&self, kind: DeviceKind, labels: BTreeMap<String, String>) -> Result<()> {
        let mut published = self.labels.write().await;
        let previous = published.remove(&kind).unwrap_or_default();

        for (key, value) in &labels {
            if previous.get(key) != Some(value) {
                info!("Node label {}={}", key, value);
            }
        }
        for key in previous.keys().filter(|k| !labels.contains_key(*k)) {
            info!("Node label {} removed", key);
        }

        published.insert(kind, labels);
        Ok(())
    }
}
