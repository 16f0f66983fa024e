//! Coordinator event types
//!
//! Everything the event loop consumes travels through one FIFO channel:
//! the three notification kinds (hold, dial-state-changed,
//! ringing-trunk-changed), the blocking requests from call-handling tasks
//! (each carrying a handshake reply handle), and the stop sentinel.

use crate::api::types::{AttemptId, CallLeg, DialStatus};
use crate::config::BlaConfig;
use crate::dial::primitive::DialState;
use crate::errors::BlaError;
use crate::handshake::HandshakeReply;

/// Which side of a call a dial-state update describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    /// The outside line's leg (inbound ring or outbound dial result)
    Trunk,
    /// A station's leg (being rung on behalf of a ringing trunk, or joined)
    Station,
}

/// Verdict the coordinator hands a ring-station worker that reported an
/// answer: exactly one concurrent answerer wins the trunk.
///
/// The won trunk may differ from the one the worker rang for — with several
/// trunks ringing at one station, the answer goes to the first trunk in the
/// station's subscription order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceVerdict {
    /// This station gets the named trunk; join its conference.
    Won {
        trunk: String,
        bridge_profile: String,
    },
    /// Another station already claimed the trunk; hang the leg up.
    Lost,
}

/// Dial-state transition reported by a dial worker (or by external call
/// teardown, for hangup of an established leg)
#[derive(Debug)]
pub struct DialStateUpdate {
    pub role: LegRole,
    pub trunk: String,
    /// Dialing station (trunk role) or rung station (station role)
    pub station: Option<String>,
    pub state: DialState,
    /// The newly answered leg, present only with `DialState::Answered`
    pub answered: Option<CallLeg>,
    /// Attempt the update belongs to, when one is outstanding
    pub attempt: Option<AttemptId>,
    /// Race-resolution handshake for station answers; the worker blocks on
    /// the other end until the coordinator picks a winner.
    pub verdict: Option<HandshakeReply<RaceVerdict>>,
}

/// Decision returned to a station task that went off-hook
#[derive(Debug)]
pub enum OffHookDecision {
    /// Trunk is idle; dial it, then join the mixing service.
    Dial { trunk: String },
    /// Trunk already has a live leg (answered ring, barge-in, or hold
    /// retrieval); join the mixing service directly.
    Join { trunk: String },
    /// No trunk available to this station.
    Congestion,
}

/// Events consumed by the coordinator loop, processed strictly FIFO
#[derive(Debug)]
pub enum BlaEvent {
    /// A station toggled hold on a trunk it is joined to
    Hold { station: String, trunk: String },

    /// A dial worker (or external teardown) reported a leg state change
    DialState(DialStateUpdate),

    /// The ringing sets changed; re-run the scheduler. Also synthesized by
    /// the loop itself on timer wakeups so timeout-driven changes interleave
    /// in FIFO order with externally-triggered ones.
    RingingTrunkChanged,

    /// Request: an inbound call is ringing a trunk. The caller's task blocks
    /// on the handshake until the episode resolves (answer, timeout, hangup).
    TrunkRinging {
        trunk: String,
        leg: CallLeg,
        done: HandshakeReply<DialStatus>,
    },

    /// Request: a station went off-hook and wants a line.
    OffHook {
        station: String,
        leg: CallLeg,
        /// Specific trunk requested, or first available in subscription order
        trunk: Option<String>,
        reply: HandshakeReply<OffHookDecision>,
    },

    /// Request: re-apply configuration (mark, re-apply, sweep), serialized
    /// with event processing.
    Reload {
        config: BlaConfig,
        reply: HandshakeReply<std::result::Result<(), BlaError>>,
    },

    /// Stop sentinel; the loop drops all ephemeral records and exits.
    Stop,
}
