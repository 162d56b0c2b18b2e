//! Vendor error record (CPER) reduction

use accel_core::devices::{CperRecord, EventSeverity};
use accel_core::DeviceId;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Most recent record of one device
#[derive(Debug, Clone, PartialEq)]
pub struct LatestCper {
    pub record: CperRecord,
    pub at: DateTime<Utc>,
}

impl LatestCper {
    /// Gauge value of the record severity
    pub fn severity_value(&self) -> f64 {
        match self.record.severity {
            EventSeverity::Debug => 0.0,
            EventSeverity::Info => 1.0,
            EventSeverity::Warn => 2.0,
            EventSeverity::Critical => 3.0,
        }
    }
}

/// Parse a vendor timestamp: RFC 3339, or `YYYY/MM/DD HH:MM:SS` as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Keep only the most recent record per device.
///
/// Records with unparseable timestamps are skipped.
pub fn latest_per_device(records: &[CperRecord]) -> BTreeMap<DeviceId, LatestCper> {
    let mut latest: BTreeMap<DeviceId, LatestCper> = BTreeMap::new();
    for record in records {
        let Some(at) = parse_timestamp(&record.timestamp) else {
            debug!("Skipping CPER record {:?} with timestamp {:?}", record.record_id, record.timestamp);
            continue;
        };
        let id = DeviceId::from_uuid_bytes(&record.device_uuid);
        match latest.get(&id) {
            Some(current) if current.at >= at => {}
            _ => {
                latest.insert(
                    id,
                    LatestCper {
                        record: record.clone(),
                        at,
                    },
                );
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_core::mock::mock_gpu;

    fn record(uuid: &[u8], id: &str, timestamp: &str) -> CperRecord {
        CperRecord {
            device_uuid: uuid.to_vec(),
            severity: EventSeverity::Critical,
            timestamp: timestamp.to_string(),
            record_id: id.to_string(),
            notify_type: "MCE".to_string(),
        }
    }

    #[test]
    fn test_parse_timestamp() {
        let a = parse_timestamp("2026/03/01 10:00:00").unwrap();
        let b = parse_timestamp("2026-03-01T11:00:00+01:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_latest_record_wins() {
        let gpu0 = mock_gpu(0);
        let gpu1 = mock_gpu(1);
        let records = vec![
            record(&gpu0.uuid, "a", "2026/03/01 10:00:00"),
            record(&gpu0.uuid, "b", "2026/03/02 09:00:00"),
            record(&gpu0.uuid, "c", "2026/03/01 23:59:59"),
            record(&gpu0.uuid, "d", "garbage"),
            record(&gpu1.uuid, "e", "2026-01-01T00:00:00Z"),
        ];

        let latest = latest_per_device(&records);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&gpu0.id()].record.record_id, "b");
        assert_eq!(latest[&gpu1.id()].record.record_id, "e");
        assert_eq!(latest[&gpu1.id()].severity_value(), 3.0);
    }
}
