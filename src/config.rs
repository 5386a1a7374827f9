use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::metadata_codec::PlacementStrategyKind;

/// Write acceptance policy for metadata persistence (§9 Open Question: resolved
/// in favor of keeping `Any` as the default, with `Majority` available for
/// installations that prefer durability over availability).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteQuorum {
    /// Accept as soon as at least one copy write succeeds.
    Any,
    /// Require `ceil(n/2) + 1` successful copy writes.
    Majority,
}

impl WriteQuorum {
    pub fn required(&self, total_copies: usize) -> usize {
        match self {
            WriteQuorum::Any => 1,
            WriteQuorum::Majority => (total_copies + 1) / 2 + 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub allocation_unit_sectors: u64,
    pub spare_headroom_percent: u8,
    pub write_quorum: WriteQuorum,
    #[serde(with = "duration_millis")]
    pub debounce: Duration,
    pub worker_queue_depth: usize,
    pub placement_override: Option<PlacementStrategyKind>,
    pub hotspot_table_size: usize,
}

impl Config {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.allocation_unit_sectors == 0 {
            errors.push("allocation_unit_sectors must be > 0".to_string());
        }
        if self.worker_queue_depth == 0 {
            errors.push("worker_queue_depth must be > 0".to_string());
        }
        if self.hotspot_table_size == 0 {
            errors.push("hotspot_table_size must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            allocation_unit_sectors: 8,
            spare_headroom_percent: 2,
            write_quorum: WriteQuorum::Any,
            debounce: Duration::from_millis(250),
            worker_queue_depth: 1024,
            placement_override: None,
            hotspot_table_size: 256,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Fluent builder mirroring the donor codebase's configuration-preset convention.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    pub fn allocation_unit_sectors(mut self, n: u64) -> Self {
        self.config.allocation_unit_sectors = n;
        self
    }

    pub fn write_quorum(mut self, q: WriteQuorum) -> Self {
        self.config.write_quorum = q;
        self
    }

    pub fn placement_override(mut self, p: PlacementStrategyKind) -> Self {
        self.config.placement_override = Some(p);
        self
    }

    pub fn build(self) -> anyhow::Result<Config> {
        self.config
            .validate()
            .map_err(|errs| anyhow::anyhow!("configuration validation failed: {}", errs.join("; ")))?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn builder_overrides_take_effect() {
        let cfg = ConfigBuilder::new()
            .allocation_unit_sectors(16)
            .write_quorum(WriteQuorum::Majority)
            .build()
            .unwrap();
        assert_eq!(cfg.allocation_unit_sectors, 16);
        assert_eq!(cfg.write_quorum.required(5), 4);
    }

    #[test]
    fn json_round_trip() {
        let cfg = Config::default();
        let json = cfg.to_json();
        let back = Config::from_json(&json).unwrap();
        assert_eq!(back.allocation_unit_sectors, cfg.allocation_unit_sectors);
    }
}
