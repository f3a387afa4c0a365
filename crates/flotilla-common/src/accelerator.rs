use serde::{Deserialize, Serialize};

/// Vendor family of an accelerator. Unknown tags deserialize to `Unknown`
/// rather than failing, so a newer agent can report vendors an older
/// aggregator has never heard of.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorVendor {
    Nvidia,
    Apple,
    Amd,
    #[serde(other)]
    Unknown,
}

impl AcceleratorVendor {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "nvidia" => Self::Nvidia,
            "apple" => Self::Apple,
            "amd" => Self::Amd,
            _ => Self::Unknown,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Nvidia => "nvidia",
            Self::Apple => "apple",
            Self::Amd => "amd",
            Self::Unknown => "unknown",
        }
    }
}

/// One GPU-class compute device as seen by a discovery pass.
///
/// A discovery pass replaces the whole record (including `extra`) rather
/// than patching fields; only the id is stable across passes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Accelerator {
    pub id: String,
    pub name: String,
    pub memory_total_mb: u64,
    pub vendor: AcceleratorVendor,
    pub compute_capability: Option<String>,

    /// Vendor-specific attributes: driver version, core count, a live
    /// utilization sample when the probe reports one.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Accelerator {
    /// Utilization sample from the attribute map, 0 when absent.
    pub fn utilization(&self) -> u64 {
        self.extra
            .get("utilization")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_tag_round_trip() {
        assert_eq!(AcceleratorVendor::from_tag("nvidia"), AcceleratorVendor::Nvidia);
        assert_eq!(AcceleratorVendor::from_tag("apple"), AcceleratorVendor::Apple);
        assert_eq!(AcceleratorVendor::from_tag("tpu"), AcceleratorVendor::Unknown);
        assert_eq!(AcceleratorVendor::Amd.as_tag(), "amd");
    }

    #[test]
    fn test_unknown_vendor_deserializes() {
        let v: AcceleratorVendor = serde_json::from_str("\"quantum\"").unwrap();
        assert_eq!(v, AcceleratorVendor::Unknown);
    }

    #[test]
    fn test_utilization_default() {
        let acc = Accelerator {
            id: "n1-gpu-0".into(),
            name: "A100".into(),
            memory_total_mb: 40960,
            vendor: AcceleratorVendor::Nvidia,
            compute_capability: None,
            extra: serde_json::Map::new(),
        };
        assert_eq!(acc.utilization(), 0);
    }
}
