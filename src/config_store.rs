//! Read-only configuration model: PLC, tag, and polling-group records as
//! loaded once at start from the relational configuration store. The core
//! never writes here and never reloads while running.
//!
//! The concrete store (SQLite, per spec §6) is a host concern outside this
//! crate; [`ConfigStore`] is the narrow trait the core needs, with an
//! in-memory implementation for tests and composition-root wiring.

use crate::mc3e::{AddressError, DeviceAddress};
use crate::sample::TagKind;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("duplicate PLC code {0:?}")]
    DuplicatePlc(String),
    #[error("duplicate tag address {0}.{1}")]
    DuplicateTag(String, String),
    #[error("duplicate polling group name {0:?}")]
    DuplicateGroup(String),
    #[error("polling group {0:?} references unknown PLC {1:?}")]
    GroupPlcMissing(String, String),
    #[error("Fixed-mode group {0:?} has interval {1}ms, must be >= 100ms")]
    IntervalTooShort(String, u64),
    #[error("Handshake-mode group {0:?} has no trigger bit address")]
    MissingTriggerAddress(String),
    #[error("invalid address in configuration: {0}")]
    Address(#[from] AddressError),
}

/// Polling mode for a group. Fixed polls at a configured interval;
/// Handshake waits on an external or PLC-side trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Fixed,
    Handshake,
}

/// A single Mitsubishi Q-series PLC, identified by its short opaque code.
#[derive(Debug, Clone)]
pub struct PlcConfig {
    pub code: String,
    pub host: String,
    pub port: u16,
    pub network: u8,
    pub station: u8,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub enabled: bool,
    pub pool_size: usize,
}

impl PlcConfig {
    pub const DEFAULT_PORT: u16 = 5010;
    pub const DEFAULT_POOL_SIZE: usize = 5;
}

/// The PLC-side storage type of a tag's value, independent of its [`TagKind`]
/// routing. `DWord`/`Real` occupy two consecutive word addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bit,
    Word,
    DWord,
    Real,
    /// Fixed-width ASCII string packed two characters per word.
    Text { word_count: u16 },
}

impl DataType {
    /// Number of consecutive word addresses (or, for `Bit`, the single bit
    /// address) a tag of this type occupies in a run.
    pub fn word_count(self) -> u16 {
        match self {
            DataType::Bit | DataType::Word => 1,
            DataType::DWord | DataType::Real => 2,
            DataType::Text { word_count } => word_count,
        }
    }

    pub fn is_bit(self) -> bool {
        matches!(self, DataType::Bit)
    }
}

/// A single polled point on a PLC.
#[derive(Debug, Clone)]
pub struct TagConfig {
    pub plc_code: String,
    pub address: DeviceAddress,
    pub data_type: DataType,
    pub kind: TagKind,
    pub scale: f64,
    pub unit: Option<String>,
    /// 14-character equipment identifier used in the deterministic tag name.
    pub machine_code: String,
    pub group_name: Option<String>,
}

/// A named set of tags on one PLC, polled together.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub name: String,
    pub plc_code: String,
    pub mode: PollMode,
    /// Fixed-mode only; `None` for Handshake groups.
    pub interval_ms: Option<u64>,
    /// Handshake-mode only; `None` for Fixed groups.
    pub trigger_address: Option<DeviceAddress>,
    pub auto_reset_trigger: bool,
    pub priority: i32,
    pub enabled: bool,
    pub tags: Vec<TagConfig>,
}

const MIN_FIXED_INTERVAL_MS: u64 = 100;

/// The full configuration snapshot the core reads at start: every PLC, every
/// group (already joined to its tags), validated against the invariants of
/// spec §3.1.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub plcs: HashMap<String, PlcConfig>,
    pub groups: HashMap<String, GroupConfig>,
}

impl Configuration {
    /// Build and validate a configuration snapshot. Untagged tags (no
    /// `group_name`) are silently dropped, per spec §3.1.
    pub fn build(
        plcs: Vec<PlcConfig>,
        groups_with_tags: Vec<(GroupConfig, Vec<TagConfig>)>,
    ) -> Result<Self, ConfigError> {
        let mut plc_map = HashMap::new();
        for plc in plcs {
            if plc_map.insert(plc.code.clone(), plc).is_some() {
                return Err(ConfigError::DuplicatePlc(
                    plc_map.keys().last().cloned().unwrap_or_default(),
                ));
            }
        }

        let mut seen_tags: std::collections::HashSet<(String, String)> = Default::default();
        let mut group_map = HashMap::new();
        for (mut group, tags) in groups_with_tags {
            if !plc_map.contains_key(&group.plc_code) {
                return Err(ConfigError::GroupPlcMissing(group.name, group.plc_code));
            }
            match group.mode {
                PollMode::Fixed => {
                    let interval = group.interval_ms.unwrap_or(0);
                    if interval < MIN_FIXED_INTERVAL_MS {
                        return Err(ConfigError::IntervalTooShort(group.name, interval));
                    }
                }
                PollMode::Handshake => {
                    if group.trigger_address.is_none() {
                        return Err(ConfigError::MissingTriggerAddress(group.name));
                    }
                }
            }
            for tag in &tags {
                let key = (tag.plc_code.clone(), tag.address.to_string());
                if !seen_tags.insert(key.clone()) {
                    return Err(ConfigError::DuplicateTag(key.0, key.1));
                }
            }
            group.tags = tags;
            if group_map.contains_key(&group.name) {
                return Err(ConfigError::DuplicateGroup(group.name));
            }
            group_map.insert(group.name.clone(), group);
        }

        Ok(Self {
            plcs: plc_map,
            groups: group_map,
        })
    }

    pub fn enabled_groups(&self) -> impl Iterator<Item = &GroupConfig> {
        self.groups.values().filter(|g| g.enabled)
    }
}

/// The read-only configuration source. The core calls `load()` exactly once
/// at start; there is no reload path while running (spec §3.1, §5).
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<Configuration, ConfigError>;
}

/// An in-memory configuration store for tests and for composition roots that
/// build configuration from some other source before handing it to the core.
pub struct InMemoryConfigStore {
    configuration: Configuration,
}

impl InMemoryConfigStore {
    pub fn new(configuration: Configuration) -> Self {
        Self { configuration }
    }
}

#[async_trait::async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn load(&self) -> Result<Configuration, ConfigError> {
        Ok(self.configuration.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc3e::DeviceCode;

    fn plc(code: &str) -> PlcConfig {
        PlcConfig {
            code: code.to_string(),
            host: "127.0.0.1".to_string(),
            port: PlcConfig::DEFAULT_PORT,
            network: 0,
            station: 0xFF,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            enabled: true,
            pool_size: PlcConfig::DEFAULT_POOL_SIZE,
        }
    }

    fn fixed_group(name: &str, plc_code: &str, interval_ms: u64) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            plc_code: plc_code.to_string(),
            mode: PollMode::Fixed,
            interval_ms: Some(interval_ms),
            trigger_address: None,
            auto_reset_trigger: false,
            priority: 0,
            enabled: true,
            tags: Vec::new(),
        }
    }

    fn tag(plc_code: &str, addr: &str) -> TagConfig {
        TagConfig {
            plc_code: plc_code.to_string(),
            address: DeviceAddress::parse(addr).unwrap(),
            data_type: DataType::Word,
            kind: TagKind::WordHost,
            scale: 1.0,
            unit: None,
            machine_code: "EQUIP0000000001".to_string(),
            group_name: Some("G1".to_string()),
        }
    }

    #[test]
    fn accepts_valid_fixed_group_at_minimum_interval() {
        let cfg = Configuration::build(
            vec![plc("PLC01")],
            vec![(
                fixed_group("G1", "PLC01", 100),
                vec![tag("PLC01", "D100")],
            )],
        )
        .unwrap();
        assert_eq!(cfg.groups.len(), 1);
        assert_eq!(cfg.groups["G1"].tags.len(), 1);
    }

    #[test]
    fn rejects_fixed_interval_below_100ms() {
        let err = Configuration::build(
            vec![plc("PLC01")],
            vec![(fixed_group("G1", "PLC01", 99), vec![])],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::IntervalTooShort(_, 99)));
    }

    #[test]
    fn rejects_group_referencing_missing_plc() {
        let err = Configuration::build(
            vec![plc("PLC01")],
            vec![(fixed_group("G1", "PLC02", 1000), vec![])],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::GroupPlcMissing(_, _)));
    }

    #[test]
    fn rejects_handshake_group_without_trigger() {
        let mut group = fixed_group("G1", "PLC01", 0);
        group.mode = PollMode::Handshake;
        group.interval_ms = None;
        let err = Configuration::build(vec![plc("PLC01")], vec![(group, vec![])]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTriggerAddress(_)));
    }

    #[test]
    fn rejects_duplicate_tag_address_within_same_plc() {
        let err = Configuration::build(
            vec![plc("PLC01")],
            vec![(
                fixed_group("G1", "PLC01", 1000),
                vec![tag("PLC01", "D100"), tag("PLC01", "D100")],
            )],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTag(_, _)));
    }

    #[test]
    fn enabled_groups_filters_disabled() {
        let mut g2 = fixed_group("G2", "PLC01", 1000);
        g2.enabled = false;
        let cfg = Configuration::build(
            vec![plc("PLC01")],
            vec![
                (fixed_group("G1", "PLC01", 1000), vec![]),
                (g2, vec![]),
            ],
        )
        .unwrap();
        let names: Vec<_> = cfg.enabled_groups().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["G1"]);
    }
}
