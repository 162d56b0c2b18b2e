//! GPU health fusion
//!
//! A verdict is computed from scratch every cycle:
//!
//! 1. every physical device starts `healthy`
//! 2. any nonzero ECC counter makes it `unhealthy`
//! 3. any critical event resolved to it makes it `unhealthy`
//! 4. operator overrides replace the result
//!
//! Events whose device UUID is not in the snapshot are logged and skipped.
//!
//! Overrides and the last published verdicts live in a [`SharedHealth`]
//! store owned by whoever outlives the device clients, so neither is lost
//! when a client is torn down and rebuilt.

use accel_core::devices::{EccCounter, EventSeverity, GpuDevice, GpuEvent};
use accel_core::{DeviceHealth, DeviceId, HealthStates, HealthVerdict};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Operator-forced verdicts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideTable {
    entries: BTreeMap<DeviceId, HealthVerdict>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear an override.
    ///
    /// `healthy` and `unhealthy` are stored; any other string removes the
    /// entry. Returns the stored verdict, if any.
    pub fn apply(&mut self, id: &DeviceId, verdict: &str) -> Option<HealthVerdict> {
        match HealthVerdict::parse_override(verdict) {
            Some(parsed) => {
                info!("Overriding health of {} to {}", id, parsed);
                self.entries.insert(id.clone(), parsed);
                Some(parsed)
            }
            None => {
                if self.entries.remove(id).is_some() {
                    info!("Cleared health override of {}", id);
                }
                None
            }
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<HealthVerdict> {
        self.entries.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Override table and last evaluation, shared across client generations
#[derive(Debug, Default)]
pub struct SharedHealth {
    overrides: RwLock<OverrideTable>,
    states: RwLock<Option<HealthStates>>,
}

impl SharedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn overrides(&self) -> OverrideTable {
        self.overrides.read().await.clone()
    }

    /// Set or clear an override and patch the published verdict in place
    pub async fn apply_override(&self, id: &DeviceId, verdict: &str) -> Option<HealthVerdict> {
        let applied = self.overrides.write().await.apply(id, verdict);
        if let Some(forced) = applied {
            if let Some(state) = self
                .states
                .write()
                .await
                .as_mut()
                .and_then(|states| states.get_mut(id))
            {
                state.verdict = forced;
            }
        }
        applied
    }

    /// Verdicts of the last successful evaluation; `None` before the first
    pub async fn states(&self) -> Option<HealthStates> {
        self.states.read().await.clone()
    }

    pub async fn publish(&self, states: HealthStates) {
        *self.states.write().await = Some(states);
    }

    /// True when the last evaluation covered the device
    pub async fn contains(&self, id: &DeviceId) -> bool {
        self.states
            .read()
            .await
            .as_ref()
            .map(|states| states.contains_key(id))
            .unwrap_or(false)
    }
}

/// True when any of the ECC counters of the device is nonzero
pub fn has_ecc_errors(device: &GpuDevice) -> bool {
    EccCounter::all().any(|counter| device.stats.ecc.get(counter) > 0)
}

/// Fuse counters, critical events and overrides into one verdict per device
pub fn evaluate(devices: &[GpuDevice], events: &[GpuEvent], overrides: &OverrideTable) -> HealthStates {
    let mut states: HealthStates = devices
        .iter()
        .map(|device| {
            let verdict = if has_ecc_errors(device) {
                debug!("GPU {} has nonzero ECC counters", device.index());
                HealthVerdict::Unhealthy
            } else {
                HealthVerdict::Healthy
            };
            (
                device.id(),
                DeviceHealth {
                    index: device.index(),
                    verdict,
                },
            )
        })
        .collect();

    let by_uuid: HashMap<&[u8], DeviceId> = devices
        .iter()
        .map(|device| (device.uuid.as_slice(), device.id()))
        .collect();

    for event in events.iter().filter(|e| e.severity == EventSeverity::Critical) {
        match by_uuid.get(event.device_uuid.as_slice()) {
            Some(id) => {
                if let Some(state) = states.get_mut(id) {
                    debug!("Critical event on {}: {}", id, event.description);
                    state.verdict = HealthVerdict::Unhealthy;
                }
            }
            None => warn!(
                "Critical event for unknown device {}",
                DeviceId::from_uuid_bytes(&event.device_uuid)
            ),
        }
    }

    for (id, state) in states.iter_mut() {
        if let Some(forced) = overrides.get(id) {
            state.verdict = forced;
        }
    }

    states
}
