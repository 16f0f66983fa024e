//! The BLA coordinator
//!
//! One `BlaCoordinator` per running instance owns the registry, the event
//! channel into the serialized event loop, and the dial coordinator. Call
//! tasks (one per inbound trunk ring or off-hook station) talk to the loop
//! exclusively through events and handshakes; the loop task is the only
//! writer of trunk/station state.

pub mod event_loop;
mod handlers;

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::api::types::{CallLeg, DialStatus};
use crate::config::BlaConfig;
use crate::dial::primitive::{DeviceStateNotifier, DialApi, DialState, Mixer};
use crate::dial::DialCoordinator;
use crate::errors::{BlaError, Result};
use crate::events::{BlaEvent, DialStateUpdate, LegRole, OffHookDecision};
use crate::handshake;
use crate::registry::Registry;

use event_loop::EventLoop;

/// Queue depth for the coordinator event channel
const EVENT_QUEUE_DEPTH: usize = 1000;

pub struct BlaCoordinator {
    registry: Arc<Registry>,
    dial: DialCoordinator,
    mixer: Arc<dyn Mixer>,
    event_tx: mpsc::Sender<BlaEvent>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BlaCoordinator {
    /// Create the coordinator and start its event loop
    pub fn new(
        config: BlaConfig,
        dial_api: Arc<dyn DialApi>,
        mixer: Arc<dyn Mixer>,
        notifier: Arc<dyn DeviceStateNotifier>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(Registry::from_config(&config)?);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let event_loop = EventLoop::new(
            registry.clone(),
            DialCoordinator::new(
                registry.clone(),
                dial_api.clone(),
                mixer.clone(),
                event_tx.clone(),
            ),
            notifier,
            config.engine.clone(),
            event_rx,
        );
        let handle = tokio::spawn(event_loop.run());

        info!(
            "BLA coordinator started: {} trunks, {} stations",
            registry.trunk_names().len(),
            registry.station_names().len()
        );

        Ok(Arc::new(Self {
            registry: registry.clone(),
            dial: DialCoordinator::new(registry, dial_api, mixer.clone(), event_tx.clone()),
            mixer,
            event_tx,
            loop_handle: Mutex::new(Some(handle)),
        }))
    }

    /// Registry access for the status/CLI surface
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle an inbound call ringing a trunk
    ///
    /// Blocks the calling task until the ringing episode resolves. On
    /// `Success` (a station answered) the trunk leg is joined to the mixing
    /// service until the call ends; `RingTimeout` and `Failure` return after
    /// the episode is torn down.
    pub async fn trunk_ringing(&self, trunk: &str, leg: CallLeg) -> Result<DialStatus> {
        let (done, wait) = handshake::pair();
        self.send(BlaEvent::TrunkRinging {
            trunk: trunk.to_string(),
            leg: leg.clone(),
            done,
        })
        .await?;

        let status = wait.wait().await?;
        if status == DialStatus::Success {
            let (profile, bridge_profile) = self
                .registry
                .with_trunk(trunk, |t| (t.profile.clone(), t.bridge_profile.clone()))
                .ok_or_else(|| BlaError::UnknownTrunk(trunk.to_string()))?;
            if let Err(e) = self.mixer.join(&leg, trunk, &profile, &bridge_profile).await {
                warn!("Trunk '{}' mixer join failed: {}", trunk, e);
            }
            // The trunk leg left the conference; the call is over.
            self.send(BlaEvent::DialState(DialStateUpdate {
                role: LegRole::Trunk,
                trunk: trunk.to_string(),
                station: None,
                state: DialState::Hangup,
                answered: None,
                attempt: None,
                verdict: None,
            }))
            .await?;
        }
        Ok(status)
    }

    /// Handle a station going off-hook
    ///
    /// Picks a line per the coordinator's decision: seize and dial an idle
    /// trunk, answer a ringing one, retrieve a held one, or barge into an
    /// active one. Blocks until the resulting call ends (or fails).
    pub async fn station_off_hook(
        &self,
        station: &str,
        leg: CallLeg,
        trunk: Option<&str>,
    ) -> Result<DialStatus> {
        let (reply, wait) = handshake::pair();
        self.send(BlaEvent::OffHook {
            station: station.to_string(),
            leg: leg.clone(),
            trunk: trunk.map(str::to_string),
            reply,
        })
        .await?;

        match wait.wait().await? {
            OffHookDecision::Congestion => Ok(DialStatus::Congestion),
            OffHookDecision::Dial { trunk } => {
                // The line was granted when the decision was made. Until a
                // dial worker takes over outcome reporting, the guard is the
                // only thing that can release the seizure: it reports a
                // failed dial if this task errors out or is dropped first.
                let grant = DialGrant::new(self.event_tx.clone(), station, &trunk);
                let status = self.dial.dial_trunk(station, &trunk, &leg).await?;
                grant.disarm();
                if status == DialStatus::Success {
                    self.join_station(station, &trunk, &leg).await?;
                }
                Ok(status)
            }
            OffHookDecision::Join { trunk } => {
                self.join_station(station, &trunk, &leg).await?;
                Ok(DialStatus::Success)
            }
        }
    }

    /// A station toggled hold on a trunk; fire-and-forget
    pub async fn hold(&self, station: &str, trunk: &str) -> Result<()> {
        self.send(BlaEvent::Hold {
            station: station.to_string(),
            trunk: trunk.to_string(),
        })
        .await
    }

    /// External teardown noticed the trunk's leg hung up (e.g. an inbound
    /// caller abandoned before answer).
    pub async fn trunk_hangup(&self, trunk: &str) -> Result<()> {
        self.send(BlaEvent::DialState(DialStateUpdate {
            role: LegRole::Trunk,
            trunk: trunk.to_string(),
            station: None,
            state: DialState::Hangup,
            answered: None,
            attempt: None,
            verdict: None,
        }))
        .await
    }

    /// Re-apply configuration (advisory live reload): mark, re-apply, sweep,
    /// serialized with event processing.
    pub async fn reload(&self, config: BlaConfig) -> Result<()> {
        let (reply, wait) = handshake::pair();
        self.send(BlaEvent::Reload { config, reply }).await?;
        wait.wait().await?
    }

    /// Stop the event loop, dropping all ephemeral ringing records
    pub async fn stop(&self) {
        let _ = self.event_tx.send(BlaEvent::Stop).await;
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("BLA coordinator stopped");
    }

    /// Join a station's own leg to a trunk's conference, blocking for the
    /// life of the call, then report the leg gone.
    async fn join_station(&self, station: &str, trunk: &str, leg: &CallLeg) -> Result<()> {
        let profile = self
            .registry
            .with_station(station, |s| s.profile.clone())
            .ok_or_else(|| BlaError::UnknownStation(station.to_string()))?;
        let bridge_profile = self
            .registry
            .with_trunk(trunk, |t| t.bridge_profile.clone())
            .ok_or_else(|| BlaError::UnknownTrunk(trunk.to_string()))?;

        if let Err(e) = self.mixer.join(leg, trunk, &profile, &bridge_profile).await {
            warn!("Station '{}' mixer join failed: {}", station, e);
        }

        self.send(BlaEvent::DialState(DialStateUpdate {
            role: LegRole::Station,
            trunk: trunk.to_string(),
            station: Some(station.to_string()),
            state: DialState::Hangup,
            answered: None,
            attempt: None,
            verdict: None,
        }))
        .await
    }

    async fn send(&self, event: BlaEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| BlaError::ChannelClosed)
    }
}

/// Holds a granted-but-not-yet-dialed line
///
/// Between the off-hook grant and the dial worker's first report, no worker
/// exists to post a terminal dial state. If the granted task errors out or
/// is dropped in that window, `Drop` reports the dial as failed so the loop
/// releases the seizure.
struct DialGrant {
    tx: Option<mpsc::Sender<BlaEvent>>,
    station: String,
    trunk: String,
}

impl DialGrant {
    fn new(tx: mpsc::Sender<BlaEvent>, station: &str, trunk: &str) -> Self {
        Self {
            tx: Some(tx),
            station: station.to_string(),
            trunk: trunk.to_string(),
        }
    }

    /// A worker has taken over reporting; the guard is done.
    fn disarm(mut self) {
        self.tx = None;
    }
}

impl Drop for DialGrant {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Drop cannot await; if the queue is full or the loop is gone
            // the grant record dies with the loop anyway.
            let _ = tx.try_send(BlaEvent::DialState(DialStateUpdate {
                role: LegRole::Trunk,
                trunk: std::mem::take(&mut self.trunk),
                station: Some(std::mem::take(&mut self.station)),
                state: DialState::Failed,
                answered: None,
                attempt: None,
                verdict: None,
            }));
        }
    }
}

impl std::fmt::Debug for BlaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlaCoordinator")
            .field("trunks", &self.registry.trunk_names().len())
            .field("stations", &self.registry.station_names().len())
            .finish()
    }
}
