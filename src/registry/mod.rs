//! Entity Registry
//!
//! Name-indexed collections of trunks and stations plus the bidirectional
//! subscription graph between them. The maps are sharded (`DashMap`), so
//! status readers never contend with the coordinator for more than one
//! bucket; structural mutation (config apply, reload sweep) runs only from
//! the coordinator event loop.

pub mod station;
pub mod trunk;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::BlaConfig;
use crate::errors::{BlaError, Result};

pub use station::{Station, StationSnapshot, TrunkRef};
pub use trunk::{StationRef, Trunk, TrunkSnapshot};

/// Reference-counted entity store; one per running engine instance
#[derive(Debug, Default)]
pub struct Registry {
    trunks: DashMap<String, Trunk>,
    stations: DashMap<String, Station>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a validated configuration
    pub fn from_config(config: &BlaConfig) -> Result<Self> {
        let registry = Self::new();
        registry.apply_config(config)?;
        Ok(registry)
    }

    /// Apply (or re-apply) configuration records and relink the
    /// trunk↔station graph
    ///
    /// Existing entities are updated in place and marked; new entities are
    /// inserted. Callers doing a live reload should `mark_all_for_reload`
    /// first and `sweep_unmarked` afterward.
    pub fn apply_config(&self, config: &BlaConfig) -> Result<()> {
        config.validate()?;

        for record in &config.trunks {
            match self.trunks.get_mut(&record.name) {
                Some(mut trunk) => {
                    debug!("Updating BLA trunk '{}'", record.name);
                    trunk.update_from_record(record);
                    trunk.station_refs.clear();
                }
                None => {
                    info!("Adding BLA trunk '{}'", record.name);
                    self.trunks
                        .insert(record.name.clone(), Trunk::from_record(record));
                }
            }
        }

        for record in &config.stations {
            match self.stations.get_mut(&record.name) {
                Some(mut station) => {
                    debug!("Updating BLA station '{}'", record.name);
                    station.update_from_record(record);
                }
                None => {
                    info!("Adding BLA station '{}'", record.name);
                    self.stations
                        .insert(record.name.clone(), Station::from_record(record));
                }
            }
        }

        // Rebuild back-references now that every named trunk is known to
        // exist (validated above).
        for record in &config.stations {
            for trunk in &record.trunks {
                self.link(&record.name, trunk.name())?;
            }
        }

        Ok(())
    }

    /// Record that `station` subscribes to `trunk` (back-reference side)
    fn link(&self, station: &str, trunk: &str) -> Result<()> {
        let mut trunk = self
            .trunks
            .get_mut(trunk)
            .ok_or_else(|| BlaError::UnknownTrunk(trunk.to_string()))?;
        trunk.add_station_ref(station);
        Ok(())
    }

    pub fn has_trunk(&self, name: &str) -> bool {
        self.trunks.contains_key(name)
    }

    pub fn has_station(&self, name: &str) -> bool {
        self.stations.contains_key(name)
    }

    /// Run `f` against a trunk, if it exists
    ///
    /// The shard guard is held only for the duration of `f`; never call back
    /// into the registry or await from inside.
    pub fn with_trunk<R>(&self, name: &str, f: impl FnOnce(&Trunk) -> R) -> Option<R> {
        self.trunks.get(name).map(|t| f(&t))
    }

    pub fn with_trunk_mut<R>(&self, name: &str, f: impl FnOnce(&mut Trunk) -> R) -> Option<R> {
        self.trunks.get_mut(name).map(|mut t| f(&mut t))
    }

    pub fn with_station<R>(&self, name: &str, f: impl FnOnce(&Station) -> R) -> Option<R> {
        self.stations.get(name).map(|s| f(&s))
    }

    pub fn with_station_mut<R>(&self, name: &str, f: impl FnOnce(&mut Station) -> R) -> Option<R> {
        self.stations.get_mut(name).map(|mut s| f(&mut s))
    }

    /// Names of stations subscribed to a trunk, in subscription order
    pub fn trunk_stations(&self, trunk: &str) -> Vec<String> {
        self.with_trunk(trunk, |t| {
            t.station_refs.iter().map(|r| r.station.clone()).collect()
        })
        .unwrap_or_default()
    }

    /// Names of trunks a station subscribes to, in priority order
    pub fn station_trunks(&self, station: &str) -> Vec<String> {
        self.with_station(station, |s| {
            s.trunk_refs.iter().map(|r| r.trunk.clone()).collect()
        })
        .unwrap_or_default()
    }

    pub fn trunk_names(&self) -> Vec<String> {
        self.trunks.iter().map(|e| e.key().clone()).collect()
    }

    pub fn station_names(&self) -> Vec<String> {
        self.stations.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshots for the status/CLI surface; safe concurrently with the
    /// event loop.
    pub fn trunk_snapshots(&self) -> Vec<TrunkSnapshot> {
        let mut snapshots: Vec<_> = self.trunks.iter().map(|e| TrunkSnapshot::of(&e)).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn station_snapshots(&self) -> Vec<StationSnapshot> {
        let mut snapshots: Vec<_> = self
            .stations
            .iter()
            .map(|e| StationSnapshot::of(&e))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Begin the reload mark phase: everything unmarked until re-applied
    pub fn mark_all_for_reload(&self) {
        for mut trunk in self.trunks.iter_mut() {
            trunk.marked = false;
        }
        for mut station in self.stations.iter_mut() {
            station.marked = false;
        }
    }

    /// Sweep phase: drop entities the re-applied configuration no longer
    /// names. Returns `(trunks_removed, stations_removed)`.
    pub fn sweep_unmarked(&self) -> (usize, usize) {
        let doomed_trunks: Vec<String> = self
            .trunks
            .iter()
            .filter(|e| !e.marked)
            .map(|e| e.key().clone())
            .collect();
        let doomed_stations: Vec<String> = self
            .stations
            .iter()
            .filter(|e| !e.marked)
            .map(|e| e.key().clone())
            .collect();

        for name in &doomed_trunks {
            warn!("Removing BLA trunk '{}' (no longer configured)", name);
            self.trunks.remove(name);
            for mut station in self.stations.iter_mut() {
                station.trunk_refs.retain(|r| &r.trunk != name);
            }
        }
        for name in &doomed_stations {
            warn!("Removing BLA station '{}' (no longer configured)", name);
            self.stations.remove(name);
            for mut trunk in self.trunks.iter_mut() {
                trunk.station_refs.retain(|r| &r.station != name);
            }
        }

        (doomed_trunks.len(), doomed_stations.len())
    }
}
