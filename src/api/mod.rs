//! Public API surface for the BLA coordination engine

pub mod types;

pub use types::{
    AttemptId, CallLeg, CallLegId, DeviceState, DialStatus, HoldPolicy, TrunkRefState,
};
