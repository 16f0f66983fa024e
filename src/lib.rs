//! # bla-core
//!
//! Bridged Line Appearance (BLA) trunk/station coordination engine.
//!
//! A BLA deployment shares a small set of outside lines ("trunks") among a
//! group of phone endpoints ("stations"), key-telephone style: every station
//! sees every shared line, an inbound call rings all subscribed stations
//! (subject to per-station ring delays), the first answer wins the line, and
//! any station can put the line on hold or pick it back up.
//!
//! ## Architecture
//!
//! All coordination state is owned by a single event-loop task inside
//! [`coordinator::BlaCoordinator`]. Call-handling tasks (one per inbound
//! trunk ring or off-hook station) and the background dial workers never
//! touch that state directly; they send events over one FIFO channel and,
//! where they need an answer, block on a one-shot handshake. Ring delays and
//! ring timeouts are computed by a pure [`scheduler`] the loop re-runs after
//! every event batch.
//!
//! The engine is transport-agnostic: the actual outbound dialing, audio
//! mixing and device-state publication are supplied by the embedder behind
//! the [`dial::primitive::DialApi`], [`dial::primitive::Mixer`] and
//! [`dial::primitive::DeviceStateNotifier`] traits.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod dial;
pub mod errors;
pub mod events;
pub mod handshake;
pub mod registry;
pub mod scheduler;

pub use api::types::{
    AttemptId, CallLeg, CallLegId, DeviceState, DialStatus, HoldPolicy, TrunkRefState,
};
pub use config::BlaConfig;
pub use coordinator::BlaCoordinator;
pub use errors::{BlaError, Result};
