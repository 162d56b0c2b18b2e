//! Device index selector (`"0-3,7"` syntax)

use std::collections::BTreeSet;
use tracing::warn;

/// Highest device index a selector may name
pub const MAX_DEVICE_INDEX: u32 = 1023;

/// Set of device indices selected for export; `All` when unrestricted
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    #[default]
    All,
    Indices(BTreeSet<u32>),
}

impl DeviceSelector {
    /// Parse a selector, falling back to `All` with a warning on bad syntax
    pub fn parse_or_all(spec: &str) -> Self {
        match Self::parse(spec) {
            Ok(selector) => selector,
            Err(e) => {
                warn!("Invalid device selector {:?} ({}), monitoring all devices", spec, e);
                DeviceSelector::All
            }
        }
    }

    /// Strict parser. An empty string selects everything.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(DeviceSelector::All);
        }

        let mut indices = BTreeSet::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err("empty list element".to_string());
            }
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_index(lo)?;
                    let hi = parse_index(hi)?;
                    if lo > hi {
                        return Err(format!("descending range {}-{}", lo, hi));
                    }
                    indices.extend(lo..=hi);
                }
                None => {
                    indices.insert(parse_index(part)?);
                }
            }
        }
        Ok(DeviceSelector::Indices(indices))
    }

    pub fn contains(&self, index: u32) -> bool {
        match self {
            DeviceSelector::All => true,
            DeviceSelector::Indices(set) => set.contains(&index),
        }
    }
}

fn parse_index(s: &str) -> Result<u32, String> {
    let index = s
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("bad index {:?}: {}", s.trim(), e))?;
    if index > MAX_DEVICE_INDEX {
        return Err(format!("index {} above {}", index, MAX_DEVICE_INDEX));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_and_lists() {
        let selector = DeviceSelector::parse("0-3, 7").unwrap();
        for i in [0, 1, 2, 3, 7] {
            assert!(selector.contains(i));
        }
        assert!(!selector.contains(4));
        assert!(!selector.contains(8));
    }

    #[test]
    fn test_empty_selects_all() {
        assert_eq!(DeviceSelector::parse("").unwrap(), DeviceSelector::All);
        assert!(DeviceSelector::All.contains(1234));
    }

    #[test]
    fn test_invalid_falls_back_to_all() {
        assert!(DeviceSelector::parse("3-1").is_err());
        assert!(DeviceSelector::parse("a,b").is_err());
        assert!(DeviceSelector::parse("1,,2").is_err());
        assert_eq!(DeviceSelector::parse_or_all("1-x"), DeviceSelector::All);
    }

    #[test]
    fn test_out_of_range_indices_select_all() {
        assert!(DeviceSelector::parse("0-4294967295").is_err());
        assert!(DeviceSelector::parse("1024").is_err());
        assert_eq!(DeviceSelector::parse_or_all("0-4294967295"), DeviceSelector::All);
        assert!(DeviceSelector::parse_or_all("0-4294967295").contains(5000));

        let widest = DeviceSelector::parse(&format!("0-{}", MAX_DEVICE_INDEX)).unwrap();
        assert!(widest.contains(MAX_DEVICE_INDEX));
        assert!(!widest.contains(MAX_DEVICE_INDEX + 1));
    }
}
