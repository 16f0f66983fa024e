//! Trunk entity: an outside line shared by zero or more stations

use serde::Serialize;
use std::time::Duration;

use crate::api::types::{CallLeg, HoldPolicy};
use crate::config::{seconds_or_unlimited, TrunkRecord};

/// Back-pointer from a trunk to one subscribed station
///
/// Holds the station's name only; the station itself is resolved through the
/// registry. This breaks the trunk↔station cycle without manual teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StationRef {
    pub station: String,
}

/// An outside line
///
/// Mutable state fields (`call_leg`, `on_hold`, the counters) are written
/// only by the coordinator event loop; other tasks read snapshots.
#[derive(Debug, Clone)]
pub struct Trunk {
    pub name: String,
    pub device: String,
    /// The live call leg on this trunk; at most one at a time.
    pub call_leg: Option<CallLeg>,
    /// `None` means ring forever.
    pub ring_timeout: Option<Duration>,
    pub barge_disabled: bool,
    pub hold_policy: HoldPolicy,
    /// Mixing-service profiles for the trunk leg and its conference.
    pub profile: String,
    pub bridge_profile: String,
    pub on_hold: bool,
    /// Stations currently joined and active on this trunk.
    pub active_stations: u32,
    /// Stations currently holding this trunk.
    pub hold_stations: u32,
    /// Subscribed stations in the order their subscriptions were added.
    pub station_refs: Vec<StationRef>,
    /// Reload mark; entities left unmarked after a re-apply are swept.
    pub(crate) marked: bool,
}

impl Trunk {
    pub fn from_record(record: &TrunkRecord) -> Self {
        Self {
            name: record.name.clone(),
            device: record.device.clone(),
            call_leg: None,
            ring_timeout: seconds_or_unlimited(record.ring_timeout),
            barge_disabled: record.barge_disabled,
            hold_policy: record.hold_access,
            profile: record.profile.clone(),
            bridge_profile: record.bridge_profile.clone(),
            on_hold: false,
            active_stations: 0,
            hold_stations: 0,
            station_refs: Vec::new(),
            marked: true,
        }
    }

    /// Re-apply a record during reload, preserving live call state and
    /// subscriptions (which are rebuilt from the station records afterward).
    pub fn update_from_record(&mut self, record: &TrunkRecord) {
        self.device = record.device.clone();
        self.ring_timeout = seconds_or_unlimited(record.ring_timeout);
        self.barge_disabled = record.barge_disabled;
        self.hold_policy = record.hold_access;
        self.profile = record.profile.clone();
        self.bridge_profile = record.bridge_profile.clone();
        self.marked = true;
    }

    /// No live leg and not held
    pub fn is_idle(&self) -> bool {
        self.call_leg.is_none() && !self.on_hold
    }

    pub fn add_station_ref(&mut self, station: &str) {
        if !self.station_refs.iter().any(|r| r.station == station) {
            self.station_refs.push(StationRef {
                station: station.to_string(),
            });
        }
    }
}

/// Read-only snapshot of a trunk for status display
#[derive(Debug, Clone, Serialize)]
pub struct TrunkSnapshot {
    pub name: String,
    pub device: String,
    pub idle: bool,
    pub on_hold: bool,
    pub active_stations: u32,
    pub hold_stations: u32,
    pub stations: Vec<String>,
}

impl TrunkSnapshot {
    pub(crate) fn of(trunk: &Trunk) -> Self {
        Self {
            name: trunk.name.clone(),
            device: trunk.device.clone(),
            idle: trunk.is_idle(),
            on_hold: trunk.on_hold,
            active_stations: trunk.active_stations,
            hold_stations: trunk.hold_stations,
            stations: trunk
                .station_refs
                .iter()
                .map(|r| r.station.clone())
                .collect(),
        }
    }
}
