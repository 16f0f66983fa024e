//! Call-leg dial coordinator
//!
//! Launches and supervises the two kinds of background call attempts:
//! dialing a trunk on behalf of an off-hook station, and ringing a station
//! on behalf of a ringing trunk. Workers never mutate trunk/station state
//! directly — they report transitions as events and, for station answers,
//! wait for the coordinator's race verdict.

pub mod primitive;

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::api::types::{split_device, AttemptId, CallLeg, DialStatus};
use crate::errors::{BlaError, Result};
use crate::events::{BlaEvent, DialStateUpdate, LegRole, RaceVerdict};
use crate::handshake;
use crate::registry::Registry;

use primitive::{DialApi, DialState, Indication, Mixer};

/// Map a terminal dial state to the status surfaced on the call leg
fn terminal_status(state: DialState) -> DialStatus {
    match state {
        DialState::Answered => DialStatus::Success,
        DialState::Timeout | DialState::Unanswered => DialStatus::Unanswered,
        DialState::Failed | DialState::Hangup | DialState::Invalid => DialStatus::Failure,
        _ => DialStatus::Failure,
    }
}

/// Map an intermediate dial state to the indication forwarded to the
/// already-connected leg
fn progress_indication(state: DialState) -> Option<Indication> {
    match state {
        DialState::Trying => Some(Indication::Progress),
        DialState::Proceeding | DialState::Progress | DialState::Ringing => {
            Some(Indication::Ringing)
        }
        _ => None,
    }
}

/// Spawns and supervises dial workers
pub struct DialCoordinator {
    registry: Arc<Registry>,
    dial_api: Arc<dyn DialApi>,
    mixer: Arc<dyn Mixer>,
    event_tx: mpsc::Sender<BlaEvent>,
}

impl DialCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        dial_api: Arc<dyn DialApi>,
        mixer: Arc<dyn Mixer>,
        event_tx: mpsc::Sender<BlaEvent>,
    ) -> Self {
        Self {
            registry,
            dial_api,
            mixer,
            event_tx,
        }
    }

    /// Dial a trunk on behalf of an off-hook station
    ///
    /// Blocks the calling (station) task until the trunk leg is confirmed
    /// answered or failed; the spawned worker then joins the trunk leg to
    /// the mixing service for the life of the call while the station task
    /// proceeds to join as its own leg.
    pub async fn dial_trunk(
        &self,
        station: &str,
        trunk: &str,
        station_leg: &CallLeg,
    ) -> Result<DialStatus> {
        let (device, profile, bridge_profile, busy) = self
            .registry
            .with_trunk(trunk, |t| {
                (
                    t.device.clone(),
                    t.profile.clone(),
                    t.bridge_profile.clone(),
                    t.call_leg.is_some(),
                )
            })
            .ok_or_else(|| BlaError::UnknownTrunk(trunk.to_string()))?;
        if busy {
            // One live leg per trunk at a time.
            return Err(BlaError::TrunkBusy(trunk.to_string()));
        }

        info!("Station '{}' dialing trunk '{}' ({})", station, trunk, device);

        let (reply, wait) = handshake::pair::<DialStatus>();
        let worker = TrunkDialWorker {
            dial_api: self.dial_api.clone(),
            mixer: self.mixer.clone(),
            event_tx: self.event_tx.clone(),
            station: station.to_string(),
            trunk: trunk.to_string(),
            device,
            profile,
            bridge_profile,
            station_leg: station_leg.clone(),
        };
        tokio::spawn(worker.run(reply));

        // Resume as soon as the worker reaches its handoff point; it keeps
        // running (inside the mixer) long after this returns.
        wait.wait().await
    }

    /// Start ringing a station on behalf of a ringing trunk
    ///
    /// Runs independently; returns the attempt id and a cancel handle for
    /// the coordinator's ringing-station record. Never blocks.
    pub fn ring_station(
        &self,
        station: &str,
        trunk: &str,
    ) -> Result<(AttemptId, oneshot::Sender<()>)> {
        let (device, profile) = self
            .registry
            .with_station(station, |s| (s.device.clone(), s.profile.clone()))
            .ok_or_else(|| BlaError::UnknownStation(station.to_string()))?;
        let trunk_leg = self
            .registry
            .with_trunk(trunk, |t| t.call_leg.clone())
            .ok_or_else(|| BlaError::UnknownTrunk(trunk.to_string()))?;

        let attempt = AttemptId::new();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        info!(
            "Ringing station '{}' ({}) for trunk '{}'",
            station, device, trunk
        );

        let worker = StationRingWorker {
            dial_api: self.dial_api.clone(),
            mixer: self.mixer.clone(),
            event_tx: self.event_tx.clone(),
            station: station.to_string(),
            trunk: trunk.to_string(),
            device,
            profile,
            trunk_leg,
            attempt: attempt.clone(),
        };
        tokio::spawn(worker.run(cancel_rx));

        Ok((attempt, cancel_tx))
    }
}

struct TrunkDialWorker {
    dial_api: Arc<dyn DialApi>,
    mixer: Arc<dyn Mixer>,
    event_tx: mpsc::Sender<BlaEvent>,
    station: String,
    trunk: String,
    device: String,
    profile: String,
    bridge_profile: String,
    station_leg: CallLeg,
}

impl TrunkDialWorker {
    async fn run(self, reply: handshake::HandshakeReply<DialStatus>) {
        let (tech, address) = split_device(&self.device);
        let mut attempt = match self.dial_api.dial(tech, address, Some(&self.station_leg)).await {
            Ok(attempt) => attempt,
            Err(e) => {
                error!("Failed to dial trunk '{}': {}", self.trunk, e);
                self.report_failed(DialState::Failed).await;
                let _ = reply.reply(DialStatus::Failure);
                return;
            }
        };

        let mut last_indication = None;
        let trunk_leg = loop {
            let Some(state) = attempt.next_state().await else {
                // Attempt ended without a terminal state report.
                self.report_failed(DialState::Failed).await;
                let _ = reply.reply(DialStatus::Failure);
                return;
            };
            debug!("Trunk '{}' dial state: {:?}", self.trunk, state);
            if state == DialState::Answered {
                match attempt.answered_leg() {
                    Some(leg) => break leg,
                    None => {
                        self.report_failed(DialState::Failed).await;
                        let _ = reply.reply(DialStatus::Failure);
                        return;
                    }
                }
            }
            if state.is_terminal() {
                info!("Trunk '{}' did not answer: {:?}", self.trunk, state);
                self.report_failed(state).await;
                let _ = reply.reply(terminal_status(state));
                return;
            }
            // Let the waiting station hear ring-back/progress.
            if let Some(indication) = progress_indication(state) {
                if last_indication != Some(indication) {
                    self.dial_api.indicate(&self.station_leg, indication).await;
                    last_indication = Some(indication);
                }
            }
        };

        info!(
            "Trunk '{}' answered call from station '{}'",
            self.trunk, self.station
        );

        // Queue the new leg before unblocking the station. The resumed
        // station task may run first, but anything it sends lands behind
        // this event in the FIFO queue, and before joining it only reads
        // profile fields the coordinator never touches.
        self.send(DialStateUpdate {
            role: LegRole::Trunk,
            trunk: self.trunk.clone(),
            station: Some(self.station.clone()),
            state: DialState::Answered,
            answered: Some(trunk_leg.clone()),
            attempt: None,
            verdict: None,
        })
        .await;
        let _ = reply.reply(DialStatus::Success);

        // Occupies this task for the life of the call.
        if let Err(e) = self
            .mixer
            .join(&trunk_leg, &self.trunk, &self.profile, &self.bridge_profile)
            .await
        {
            warn!("Trunk '{}' mixer join failed: {}", self.trunk, e);
        }

        self.send(DialStateUpdate {
            role: LegRole::Trunk,
            trunk: self.trunk.clone(),
            station: None,
            state: DialState::Hangup,
            answered: None,
            attempt: None,
            verdict: None,
        })
        .await;
    }

    async fn send(&self, update: DialStateUpdate) {
        // A closed channel means the coordinator is gone; drop the event.
        let _ = self.event_tx.send(BlaEvent::DialState(update)).await;
    }

    /// Tell the coordinator the outbound dial ended without a trunk leg so
    /// it can revert the dialing station's seizure.
    async fn report_failed(&self, state: DialState) {
        self.send(DialStateUpdate {
            role: LegRole::Trunk,
            trunk: self.trunk.clone(),
            station: Some(self.station.clone()),
            state,
            answered: None,
            attempt: None,
            verdict: None,
        })
        .await;
    }
}

struct StationRingWorker {
    dial_api: Arc<dyn DialApi>,
    mixer: Arc<dyn Mixer>,
    event_tx: mpsc::Sender<BlaEvent>,
    station: String,
    trunk: String,
    device: String,
    profile: String,
    trunk_leg: Option<CallLeg>,
    attempt: AttemptId,
}

impl StationRingWorker {
    async fn run(self, mut cancel_rx: oneshot::Receiver<()>) {
        let (tech, address) = split_device(&self.device);
        let mut attempt = match self
            .dial_api
            .dial(tech, address, self.trunk_leg.as_ref())
            .await
        {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!("Failed to ring station '{}': {}", self.station, e);
                self.report(DialState::Failed, None, None).await;
                return;
            }
        };

        let mut last_indication = None;
        let station_leg = loop {
            let state = tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("Ring attempt for station '{}' cancelled", self.station);
                    attempt.cancel().await;
                    return;
                }
                state = attempt.next_state() => state,
            };
            let Some(state) = state else {
                self.report(DialState::Unanswered, None, None).await;
                return;
            };
            debug!("Station '{}' dial state: {:?}", self.station, state);
            if state == DialState::Answered {
                match attempt.answered_leg() {
                    Some(leg) => break leg,
                    None => {
                        self.report(DialState::Failed, None, None).await;
                        return;
                    }
                }
            }
            if state.is_terminal() {
                info!("Station '{}' did not answer: {:?}", self.station, state);
                self.report(state, None, None).await;
                return;
            }
            // Ring-back toward the outside caller.
            if let (Some(trunk_leg), Some(indication)) =
                (self.trunk_leg.as_ref(), progress_indication(state))
            {
                if last_indication != Some(indication) {
                    self.dial_api.indicate(trunk_leg, indication).await;
                    last_indication = Some(indication);
                }
            }
        };

        // Report "I answered" and let the coordinator pick the winner; the
        // ringing-trunk record is removed there, atomically with the choice.
        let (verdict_reply, verdict_wait) = handshake::pair::<RaceVerdict>();
        self.report(
            DialState::Answered,
            Some(station_leg.clone()),
            Some(verdict_reply),
        )
        .await;

        match verdict_wait.wait().await {
            Ok(RaceVerdict::Won {
                trunk,
                bridge_profile,
            }) => {
                info!(
                    "Station '{}' won trunk '{}'; joining mix",
                    self.station, trunk
                );
                if let Err(e) = self
                    .mixer
                    .join(&station_leg, &trunk, &self.profile, &bridge_profile)
                    .await
                {
                    warn!("Station '{}' mixer join failed: {}", self.station, e);
                }
                // Left the conference; tell the coordinator the leg is gone.
                let _ = self
                    .event_tx
                    .send(BlaEvent::DialState(DialStateUpdate {
                        role: LegRole::Station,
                        trunk,
                        station: Some(self.station.clone()),
                        state: DialState::Hangup,
                        answered: None,
                        attempt: None,
                        verdict: None,
                    }))
                    .await;
            }
            Ok(RaceVerdict::Lost) => {
                info!(
                    "Station '{}' lost the race for trunk '{}'; hanging up",
                    self.station, self.trunk
                );
                self.dial_api.hangup(&station_leg).await;
            }
            Err(_) => {
                // Coordinator went away before deciding.
                self.dial_api.hangup(&station_leg).await;
            }
        }
    }

    async fn report(
        &self,
        state: DialState,
        answered: Option<CallLeg>,
        verdict: Option<handshake::HandshakeReply<RaceVerdict>>,
    ) {
        let _ = self
            .event_tx
            .send(BlaEvent::DialState(DialStateUpdate {
                role: LegRole::Station,
                trunk: self.trunk.clone(),
                station: Some(self.station.clone()),
                state,
                answered,
                attempt: Some(self.attempt.clone()),
                verdict,
            }))
            .await;
    }
}
