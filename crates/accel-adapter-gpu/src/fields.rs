//! GPU field catalogue

use crate::cper::LatestCper;
use accel_core::devices::{EccCounter, GpuDevice};
use accel_core::HealthVerdict;
use accel_metrics::GaugeSpec;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

pub const GPU_NODES_TOTAL: &str = "GPU_NODES_TOTAL";
pub const GPU_HEALTH: &str = "GPU_HEALTH";
pub const GPU_CPER_LATEST_SEVERITY: &str = "GPU_CPER_LATEST_SEVERITY";
pub const GPU_CPER_LATEST_TIMESTAMP: &str = "GPU_CPER_LATEST_TIMESTAMP";

/// Prefix of profiler-sourced fields
pub const PROFILER_PREFIX: &str = "GPU_PROF_";

const STAT_FIELDS: [(&str, &str); 10] = [
    ("GPU_PACKAGE_POWER", "Current package power in watts"),
    ("GPU_AVERAGE_PACKAGE_POWER", "Average package power in watts"),
    ("GPU_EDGE_TEMPERATURE", "Edge temperature in celsius"),
    ("GPU_JUNCTION_TEMPERATURE", "Junction (hotspot) temperature in celsius"),
    ("GPU_MEMORY_TEMPERATURE", "Memory temperature in celsius"),
    ("GPU_GFX_ACTIVITY", "Graphics engine activity in percent"),
    ("GPU_UMC_ACTIVITY", "Memory controller activity in percent"),
    ("GPU_USED_VRAM", "Used VRAM in megabytes"),
    ("GPU_TOTAL_VRAM", "Total VRAM in megabytes"),
    ("GPU_ENERGY_CONSUMED", "Accumulated energy consumed in microjoules"),
];

/// Profiler counters exported under [`PROFILER_PREFIX`]
const PROFILER_FIELDS: [&str; 8] = [
    "GRBM_GUI_ACTIVE",
    "GRBM_COUNT",
    "SQ_WAVES",
    "SQ_BUSY_CYCLES",
    "OCCUPANCY_PERCENT",
    "TENSOR_ACTIVE_PERCENT",
    "VALU_PIPE_ISSUE_UTIL",
    "MEMORY_BYTES_TOTAL",
];

/// Every per-device field, with help text
pub fn catalogue() -> Vec<GaugeSpec> {
    let mut specs: Vec<GaugeSpec> = STAT_FIELDS
        .iter()
        .map(|(name, help)| GaugeSpec::new(*name, *help))
        .collect();
    specs.push(GaugeSpec::new(GPU_HEALTH, "GPU health (1 healthy, 0 otherwise)"));
    specs.push(GaugeSpec::new(
        GPU_CPER_LATEST_SEVERITY,
        "Severity of the most recent vendor error record",
    ));
    specs.push(GaugeSpec::new(
        GPU_CPER_LATEST_TIMESTAMP,
        "Unix time of the most recent vendor error record",
    ));
    specs.extend(
        EccCounter::all().map(|c| GaugeSpec::new(c.field_name(), "ECC error count")),
    );
    specs.extend(PROFILER_FIELDS.iter().map(|f| {
        GaugeSpec::new(format!("{}{}", PROFILER_PREFIX, f), "Profiler counter")
    }));
    specs
}

/// Fields exported once per session
pub fn static_catalogue() -> Vec<GaugeSpec> {
    vec![GaugeSpec::new(GPU_NODES_TOTAL, "Number of physical GPUs")]
}

/// Resolve the enabled field set.
///
/// An empty selection enables every field. Unknown names are ignored with a
/// warning. Profiler fields are dropped when the profiler is disabled.
pub fn resolve(enabled: &[String], profiler_enabled: bool) -> Vec<GaugeSpec> {
    let all = catalogue();
    let selected: Vec<GaugeSpec> = if enabled.is_empty() {
        all
    } else {
        let wanted: BTreeSet<String> = enabled.iter().map(|f| f.trim().to_ascii_uppercase()).collect();
        for name in &wanted {
            if !all.iter().any(|spec| &spec.field == name) && name != GPU_NODES_TOTAL {
                warn!("Ignoring unknown GPU field {:?}", name);
            }
        }
        all.into_iter().filter(|spec| wanted.contains(&spec.field)).collect()
    };

    selected
        .into_iter()
        .filter(|spec| profiler_enabled || !spec.field.starts_with(PROFILER_PREFIX))
        .collect()
}

/// Values of every per-device field available for one device
pub fn device_values(
    device: &GpuDevice,
    health: Option<HealthVerdict>,
    cper: Option<&LatestCper>,
    profiler: Option<&BTreeMap<String, f64>>,
) -> Vec<(String, f64)> {
    let stats = &device.stats;
    let mut values: Vec<(String, f64)> = [
        stats.package_power,
        stats.average_package_power,
        stats.edge_temperature,
        stats.junction_temperature,
        stats.memory_temperature,
        stats.gfx_activity,
        stats.umc_activity,
        stats.used_vram,
        stats.total_vram,
        stats.energy_consumed,
    ]
    .into_iter()
    .zip(STAT_FIELDS.iter())
    .map(|(value, (name, _))| (name.to_string(), value))
    .collect();

    values.extend(EccCounter::all().map(|c| (c.field_name(), stats.ecc.get(c) as f64)));

    if let Some(verdict) = health {
        values.push((GPU_HEALTH.to_string(), verdict.gauge_value()));
    }

    if let Some(latest) = cper {
        values.push((GPU_CPER_LATEST_SEVERITY.to_string(), latest.severity_value()));
        values.push((GPU_CPER_LATEST_TIMESTAMP.to_string(), latest.at.timestamp() as f64));
    }

    if let Some(counters) = profiler {
        for (field, value) in counters {
            let field = format!("{}{}", PROFILER_PREFIX, field.to_ascii_uppercase());
            values.push((field, *value));
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_core::devices::{EccBlock, EccKind};
    use accel_core::mock::mock_gpu;

    #[test]
    fn test_empty_selection_enables_everything() {
        let all = resolve(&[], true);
        assert_eq!(all.len(), catalogue().len());
        assert_eq!(all.len(), 10 + 3 + 36 + 8);

        let without_profiler = resolve(&[], false);
        assert!(without_profiler.iter().all(|s| !s.field.starts_with(PROFILER_PREFIX)));
    }

    #[test]
    fn test_selection_is_case_insensitive() {
        let fields = resolve(
            &["gpu_health".to_string(), "GPU_ECC_UNCORRECT_UMC".to_string(), "nope".to_string()],
            false,
        );
        let names: Vec<&str> = fields.iter().map(|s| s.field.as_str()).collect();
        assert_eq!(names, vec!["GPU_HEALTH", "GPU_ECC_UNCORRECT_UMC"]);
        assert_eq!(fields[0].metric_name(), "gpu_health");
    }

    #[test]
    fn test_device_values() {
        let mut device = mock_gpu(0);
        device.stats.ecc.set(
            EccCounter {
                block: EccBlock::Umc,
                kind: EccKind::Uncorrectable,
            },
            4,
        );
        let mut profiler = BTreeMap::new();
        profiler.insert("grbm_gui_active".to_string(), 77.0);

        let values: BTreeMap<String, f64> =
            device_values(&device, Some(HealthVerdict::Unhealthy), None, Some(&profiler))
                .into_iter()
                .collect();
        assert_eq!(values["GPU_PACKAGE_POWER"], 350.0);
        assert_eq!(values["GPU_ECC_UNCORRECT_UMC"], 4.0);
        assert_eq!(values["GPU_HEALTH"], 0.0);
        assert_eq!(values["GPU_PROF_GRBM_GUI_ACTIVE"], 77.0);
        assert!(!values.contains_key(GPU_CPER_LATEST_SEVERITY));
    }
}
