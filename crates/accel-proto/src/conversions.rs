//! Conversions between accel-core health types and protobuf types

use crate::health::v1 as proto;
use accel_core::{DeviceHealth, DeviceId, HealthVerdict};

impl From<HealthVerdict> for proto::Health {
    fn from(verdict: HealthVerdict) -> Self {
        match verdict {
            HealthVerdict::Healthy => proto::Health::Healthy,
            HealthVerdict::Unhealthy => proto::Health::Unhealthy,
            HealthVerdict::Unknown => proto::Health::Unknown,
        }
    }
}

impl From<proto::Health> for HealthVerdict {
    fn from(health: proto::Health) -> Self {
        match health {
            proto::Health::Healthy => HealthVerdict::Healthy,
            proto::Health::Unhealthy => HealthVerdict::Unhealthy,
            proto::Health::Unknown | proto::Health::Unspecified => HealthVerdict::Unknown,
        }
    }
}

impl proto::DeviceState {
    /// State of an evaluated device
    pub fn evaluated(id: &DeviceId, health: &DeviceHealth) -> Self {
        Self {
            id: id.to_string(),
            index: health.index,
            health: proto::Health::from(health.verdict) as i32,
        }
    }

    /// Verdict carried by this message; unrecognized values read as unknown
    pub fn verdict(&self) -> HealthVerdict {
        proto::Health::try_from(self.health)
            .map(HealthVerdict::from)
            .unwrap_or(HealthVerdict::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_state_round_trip() {
        let id = DeviceId::new("a1000000-0000-0000-0000-000000000003");
        let state = proto::DeviceState::evaluated(
            &id,
            &DeviceHealth {
                index: 3,
                verdict: HealthVerdict::Unhealthy,
            },
        );
        assert_eq!(state.id, id.to_string());
        assert_eq!(state.index, 3);
        assert_eq!(state.verdict(), HealthVerdict::Unhealthy);
    }

    #[test]
    fn test_unknown_wire_value() {
        let state = proto::DeviceState {
            id: "x".to_string(),
            index: 0,
            health: 42,
        };
        assert_eq!(state.verdict(), HealthVerdict::Unknown);
    }
}
