//! Station entity: a phone endpoint that may use one or more trunks

use serde::Serialize;
use std::time::Duration;

use crate::api::types::{AttemptId, CallLeg, HoldPolicy, TrunkRefState};
use crate::config::{seconds_or_unlimited, StationRecord};

/// A station's view of one trunk it subscribes to
///
/// Owned forward reference; the trunk itself is resolved through the
/// registry by name. Per-pair timeout/delay overrides take priority over the
/// station's defaults.
#[derive(Debug, Clone)]
pub struct TrunkRef {
    pub trunk: String,
    pub state: TrunkRefState,
    /// The station's own call leg while it is joined to this trunk.
    pub call_leg: Option<CallLeg>,
    pub ring_timeout: Option<Duration>,
    pub ring_delay: Option<Duration>,
}

impl TrunkRef {
    pub fn new(trunk: &str, ring_timeout: Option<Duration>, ring_delay: Option<Duration>) -> Self {
        Self {
            trunk: trunk.to_string(),
            state: TrunkRefState::Idle,
            call_leg: None,
            ring_timeout,
            ring_delay,
        }
    }
}

/// A phone endpoint
///
/// Mutable state (`dial_attempt`, trunk-ref states) is written only by the
/// coordinator event loop.
#[derive(Debug, Clone)]
pub struct Station {
    pub name: String,
    pub device: String,
    /// Default ring timeout; `None` means ring forever.
    pub ring_timeout: Option<Duration>,
    /// Default delay before this station starts ringing for a ringing trunk.
    pub ring_delay: Option<Duration>,
    pub hold_policy: HoldPolicy,
    /// Mixing-service user profile for this station's leg.
    pub profile: String,
    /// Outstanding outbound dial attempt; at most one per station.
    pub dial_attempt: Option<AttemptId>,
    /// Subscribed trunks in priority order (first listed wins ties).
    pub trunk_refs: Vec<TrunkRef>,
    pub(crate) marked: bool,
}

impl Station {
    pub fn from_record(record: &StationRecord) -> Self {
        let mut station = Self {
            name: record.name.clone(),
            device: record.device.clone(),
            ring_timeout: seconds_or_unlimited(record.ring_timeout),
            ring_delay: seconds_or_unlimited(record.ring_delay),
            hold_policy: record.hold_access,
            profile: record.profile.clone(),
            dial_attempt: None,
            trunk_refs: Vec::new(),
            marked: true,
        };
        station.rebuild_trunk_refs(record);
        station
    }

    /// Re-apply a record during reload; live per-trunk call state is carried
    /// over for subscriptions that survive.
    pub fn update_from_record(&mut self, record: &StationRecord) {
        self.device = record.device.clone();
        self.ring_timeout = seconds_or_unlimited(record.ring_timeout);
        self.ring_delay = seconds_or_unlimited(record.ring_delay);
        self.hold_policy = record.hold_access;
        self.profile = record.profile.clone();
        self.marked = true;

        let previous = std::mem::take(&mut self.trunk_refs);
        self.rebuild_trunk_refs(record);
        for old in previous {
            if let Some(new) = self.trunk_refs.iter_mut().find(|r| r.trunk == old.trunk) {
                new.state = old.state;
                new.call_leg = old.call_leg;
            }
        }
    }

    fn rebuild_trunk_refs(&mut self, record: &StationRecord) {
        for trunk in &record.trunks {
            if self.trunk_refs.iter().any(|r| r.trunk == trunk.name()) {
                continue;
            }
            self.trunk_refs.push(TrunkRef::new(
                trunk.name(),
                trunk.ring_timeout(),
                trunk.ring_delay(),
            ));
        }
    }

    pub fn trunk_ref(&self, trunk: &str) -> Option<&TrunkRef> {
        self.trunk_refs.iter().find(|r| r.trunk == trunk)
    }

    pub fn trunk_ref_mut(&mut self, trunk: &str) -> Option<&mut TrunkRef> {
        self.trunk_refs.iter_mut().find(|r| r.trunk == trunk)
    }

    /// Whether the station currently has a live leg on any trunk
    pub fn in_call(&self) -> bool {
        self.trunk_refs.iter().any(|r| r.call_leg.is_some())
    }

    /// Whether an outbound ring attempt toward this station is outstanding
    pub fn is_ringing(&self) -> bool {
        self.dial_attempt.is_some()
    }
}

/// Read-only snapshot of a station for status display
#[derive(Debug, Clone, Serialize)]
pub struct StationSnapshot {
    pub name: String,
    pub device: String,
    pub ringing: bool,
    pub trunks: Vec<(String, TrunkRefState)>,
}

impl StationSnapshot {
    pub(crate) fn of(station: &Station) -> Self {
        Self {
            name: station.name.clone(),
            device: station.device.clone(),
            ringing: station.is_ringing(),
            trunks: station
                .trunk_refs
                .iter()
                .map(|r| (r.trunk.clone(), r.state))
                .collect(),
        }
    }
}
