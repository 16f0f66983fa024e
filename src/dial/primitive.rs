//! External collaborator seams
//!
//! The engine treats the dialing primitive, the mixing service and the
//! device-state notifier as externally supplied implementations behind
//! these traits. Tests script them; production embeds the real stack.

use async_trait::async_trait;

use crate::api::types::{CallLeg, DeviceState};
use crate::errors::Result;

/// States an outbound call attempt moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    Trying,
    Proceeding,
    Progress,
    Ringing,
    Answered,
    Failed,
    Hangup,
    Timeout,
    Unanswered,
    Invalid,
}

impl DialState {
    /// Terminal states end the attempt; everything else is progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DialState::Answered
                | DialState::Failed
                | DialState::Hangup
                | DialState::Timeout
                | DialState::Unanswered
                | DialState::Invalid
        )
    }
}

/// Call-progress indication forwarded to an already-connected leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indication {
    Ringing,
    Progress,
}

/// The low-level outbound call-attempt primitive
#[async_trait]
pub trait DialApi: Send + Sync {
    /// Launch an asynchronous outbound attempt against `tech/address`,
    /// optionally on behalf of an originating leg.
    async fn dial(
        &self,
        tech: &str,
        address: &str,
        originator: Option<&CallLeg>,
    ) -> Result<Box<dyn DialAttempt>>;

    /// Forward a call-progress indication to a live leg.
    async fn indicate(&self, leg: &CallLeg, indication: Indication);

    /// Hang up a live leg.
    async fn hangup(&self, leg: &CallLeg);
}

/// A single in-flight outbound attempt
#[async_trait]
pub trait DialAttempt: Send {
    /// Await the next state transition; `None` once the attempt is finished.
    async fn next_state(&mut self) -> Option<DialState>;

    /// Current state without waiting.
    fn state(&self) -> DialState;

    /// The leg that answered; present only after `Answered`.
    fn answered_leg(&self) -> Option<CallLeg>;

    /// Abort the attempt, hanging up anything outstanding.
    async fn cancel(&mut self);
}

/// The audio mixing/conferencing service
#[async_trait]
pub trait Mixer: Send + Sync {
    /// Join a leg to the named conference. Blocks until the leg leaves the
    /// conference, which is how remote hangup is observed.
    async fn join(
        &self,
        leg: &CallLeg,
        conference: &str,
        user_profile: &str,
        bridge_profile: &str,
    ) -> Result<()>;
}

/// Fire-and-forget device-state sink for external status display
///
/// Called on every trunk-ref state transition with the composite
/// `station_trunk` key.
pub trait DeviceStateNotifier: Send + Sync {
    fn notify(&self, key: &str, state: DeviceState);
}

/// Notifier that drops everything, for embedders without a status surface.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl DeviceStateNotifier for NullNotifier {
    fn notify(&self, _key: &str, _state: DeviceState) {}
}
