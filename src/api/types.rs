//! Shared types for the BLA coordination engine
//!
//! Type definitions used across the registry, scheduler, dial coordinator
//! and event loop: call-leg handles, perceived trunk states, hold policy
//! and the user-visible status values.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a live call leg
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallLegId(pub String);

impl CallLegId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallLegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a live connected call leg (trunk side or station side)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLeg {
    pub id: CallLegId,
    /// Device locator the leg was established against, `tech/address` form
    pub device: String,
}

impl CallLeg {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            id: CallLegId::new(),
            device: device.into(),
        }
    }
}

/// Unique identifier for an outstanding outbound dial attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub String);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User-visible outcome set on a call leg when an operation completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialStatus {
    Success,
    Failure,
    Congestion,
    RingTimeout,
    Unanswered,
}

/// A station's perceived state of one of its trunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrunkRefState {
    Idle,
    Ringing,
    Up,
    OnHold,
    OnHoldByMe,
}

/// Hold-access policy for a trunk or station
///
/// `Private` restricts retrieval of a held trunk to the station that put it
/// on hold; `Open` lets any sharing station pick it back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldPolicy {
    #[default]
    Open,
    Private,
}

/// Device state published to the external notifier on every trunk-ref
/// transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    NotInUse,
    Ringing,
    InUse,
    OnHold,
}

impl From<TrunkRefState> for DeviceState {
    fn from(state: TrunkRefState) -> Self {
        match state {
            TrunkRefState::Idle => DeviceState::NotInUse,
            TrunkRefState::Ringing => DeviceState::Ringing,
            TrunkRefState::Up => DeviceState::InUse,
            TrunkRefState::OnHold | TrunkRefState::OnHoldByMe => DeviceState::OnHold,
        }
    }
}

/// Split a device locator into `(tech, address)` on the first `/`
///
/// Locators without a `/` are treated as a bare address with an empty tech.
pub fn split_device(device: &str) -> (&str, &str) {
    match device.split_once('/') {
        Some((tech, address)) => (tech, address),
        None => ("", device),
    }
}
