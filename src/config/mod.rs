//! Configuration records for trunks and stations
//!
//! The engine consumes one record per entity — key/value fields the external
//! configuration loader parsed — and performs its own cross-reference
//! validation: every trunk named by a station must exist and end up knowing
//! about that station. Dangling references are fatal at load time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::api::types::HoldPolicy;
use crate::errors::{BlaError, Result};

/// Record defining one trunk (an outside line)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrunkRecord {
    pub name: String,
    /// Device locator, `tech/address` form. Required.
    pub device: String,
    /// Ring timeout in seconds; 0 means unlimited.
    #[serde(default)]
    pub ring_timeout: u64,
    /// Disallow stations joining while the trunk is already up.
    #[serde(default)]
    pub barge_disabled: bool,
    #[serde(default)]
    pub hold_access: HoldPolicy,
    /// Mixing-service user profile for the trunk's own leg.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Mixing-service bridge profile for this trunk's conference.
    #[serde(default = "default_profile")]
    pub bridge_profile: String,
}

fn default_profile() -> String {
    "default".to_string()
}

/// A station's subscription to one trunk, optionally with per-pair
/// ring-timeout/ring-delay overrides that take priority over the station's
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StationTrunk {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        ring_timeout: Option<u64>,
        #[serde(default)]
        ring_delay: Option<u64>,
    },
}

impl StationTrunk {
    pub fn name(&self) -> &str {
        match self {
            StationTrunk::Name(name) => name,
            StationTrunk::Detailed { name, .. } => name,
        }
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        match self {
            StationTrunk::Name(_) => None,
            StationTrunk::Detailed { ring_timeout, .. } => {
                ring_timeout.filter(|t| *t > 0).map(Duration::from_secs)
            }
        }
    }

    pub fn ring_delay(&self) -> Option<Duration> {
        match self {
            StationTrunk::Name(_) => None,
            StationTrunk::Detailed { ring_delay, .. } => {
                ring_delay.filter(|d| *d > 0).map(Duration::from_secs)
            }
        }
    }
}

/// Record defining one station (a phone endpoint)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRecord {
    pub name: String,
    /// Device locator, `tech/address` form. Required.
    pub device: String,
    /// Default ring timeout in seconds; 0 means unlimited.
    #[serde(default)]
    pub ring_timeout: u64,
    /// Default ring delay in seconds before this station starts ringing.
    #[serde(default)]
    pub ring_delay: u64,
    #[serde(default)]
    pub hold_access: HoldPolicy,
    /// Mixing-service user profile for this station's leg.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Trunks this station presents, in priority order.
    #[serde(default)]
    pub trunks: Vec<StationTrunk>,
}

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a station that failed to answer is skipped before it becomes
    /// eligible to ring again.
    #[serde(default = "default_failed_station_cooldown_ms")]
    pub failed_station_cooldown_ms: u64,
}

fn default_failed_station_cooldown_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failed_station_cooldown_ms: default_failed_station_cooldown_ms(),
        }
    }
}

impl EngineConfig {
    pub fn failed_station_cooldown(&self) -> Duration {
        Duration::from_millis(self.failed_station_cooldown_ms)
    }
}

/// Complete configuration for one running engine instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlaConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub trunks: Vec<TrunkRecord>,
    #[serde(default)]
    pub stations: Vec<StationRecord>,
}

impl BlaConfig {
    /// Parse a TOML configuration document
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: BlaConfig =
            toml::from_str(input).map_err(|e| BlaError::config(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate required fields and cross-references
    ///
    /// Every trunk named in a station's trunk list must be defined, trunk
    /// and station names must be unique, and device strings are required.
    pub fn validate(&self) -> Result<()> {
        let mut trunk_names = std::collections::HashSet::new();
        for trunk in &self.trunks {
            if trunk.name.is_empty() {
                return Err(BlaError::config("trunk with empty name"));
            }
            if trunk.device.is_empty() {
                return Err(BlaError::config(format!(
                    "trunk '{}' has no device",
                    trunk.name
                )));
            }
            if !trunk_names.insert(trunk.name.as_str()) {
                return Err(BlaError::config(format!(
                    "duplicate trunk '{}'",
                    trunk.name
                )));
            }
        }

        let mut station_names = std::collections::HashSet::new();
        for station in &self.stations {
            if station.name.is_empty() {
                return Err(BlaError::config("station with empty name"));
            }
            if station.device.is_empty() {
                return Err(BlaError::config(format!(
                    "station '{}' has no device",
                    station.name
                )));
            }
            if !station_names.insert(station.name.as_str()) {
                return Err(BlaError::config(format!(
                    "duplicate station '{}'",
                    station.name
                )));
            }
            for trunk in &station.trunks {
                if !trunk_names.contains(trunk.name()) {
                    return Err(BlaError::config(format!(
                        "station '{}' references unknown trunk '{}'",
                        station.name,
                        trunk.name()
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Convert a configured timeout in seconds to the engine's representation;
/// zero means unlimited.
pub(crate) fn seconds_or_unlimited(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
