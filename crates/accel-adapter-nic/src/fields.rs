//! NIC field catalogue

use accel_core::devices::NicPortStats;
use accel_metrics::GaugeSpec;
use std::collections::BTreeSet;
use tracing::warn;

pub const NIC_NODES_TOTAL: &str = "NIC_NODES_TOTAL";

/// Per-port counters
pub const PORT_FIELDS: [(&str, &str); 7] = [
    ("NIC_TX_BYTES", "Bytes transmitted"),
    ("NIC_RX_BYTES", "Bytes received"),
    ("NIC_TX_PACKETS", "Packets transmitted"),
    ("NIC_RX_PACKETS", "Packets received"),
    ("NIC_TX_ERRORS", "Transmit errors"),
    ("NIC_RX_ERRORS", "Receive errors"),
    ("NIC_RX_DROPS", "Received packets dropped"),
];

pub fn catalogue() -> Vec<GaugeSpec> {
    PORT_FIELDS
        .iter()
        .map(|(name, help)| GaugeSpec::new(*name, *help))
        .collect()
}

pub fn static_catalogue() -> Vec<GaugeSpec> {
    vec![GaugeSpec::new(NIC_NODES_TOTAL, "Number of network adapters")]
}

/// Enabled port fields; empty enables all, unknown names are ignored
pub fn resolve(enabled: &[String]) -> Vec<GaugeSpec> {
    if enabled.is_empty() {
        return catalogue();
    }
    let wanted: BTreeSet<String> = enabled.iter().map(|f| f.trim().to_ascii_uppercase()).collect();
    for name in &wanted {
        if !PORT_FIELDS.iter().any(|(field, _)| field == name) && name != NIC_NODES_TOTAL {
            warn!("Ignoring unknown NIC field {:?}", name);
        }
    }
    catalogue()
        .into_iter()
        .filter(|spec| wanted.contains(&spec.field))
        .collect()
}

pub fn port_values(stats: &NicPortStats) -> [(&'static str, f64); 7] {
    let values = [
        stats.tx_bytes,
        stats.rx_bytes,
        stats.tx_packets,
        stats.rx_packets,
        stats.tx_errors,
        stats.rx_errors,
        stats.rx_drops,
    ];
    let mut out = [("", 0.0); 7];
    for (slot, ((name, _), value)) in out.iter_mut().zip(PORT_FIELDS.iter().zip(values)) {
        *slot = (*name, value as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(resolve(&[]).len(), PORT_FIELDS.len());
        let specs = resolve(&["nic_rx_drops".to_string(), "bogus".to_string()]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].metric_name(), "nic_rx_drops");
    }

    #[test]
    fn test_port_values_follow_catalogue_order() {
        let stats = NicPortStats {
            tx_bytes: 10,
            rx_drops: 3,
            ..Default::default()
        };
        let values = port_values(&stats);
        assert_eq!(values[0], ("NIC_TX_BYTES", 10.0));
        assert_eq!(values[6], ("NIC_RX_DROPS", 3.0));
    }
}
