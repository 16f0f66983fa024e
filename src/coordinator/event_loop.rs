//! The serialized coordinator event loop
//!
//! A single task owns every piece of mutable coordination state: the
//! ephemeral ringing/failed lists, the pending outbound dials, and (by
//! discipline) all trunk/station state fields in the registry. It blocks on
//! the event channel with a deadline equal to the scheduler's next timeout,
//! drains the queue FIFO, and re-runs the scheduler after every batch.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::types::CallLeg;
use crate::config::EngineConfig;
use crate::dial::primitive::DeviceStateNotifier;
use crate::dial::DialCoordinator;
use crate::events::BlaEvent;
use crate::registry::Registry;
use crate::scheduler::{self, FailedStation, RingingStation, RingingTrunk};

/// An off-hook station whose trunk dial has not yet resolved; keeps the
/// trunk from being seized twice and carries the station leg to attach on
/// answer.
#[derive(Debug)]
pub(crate) struct PendingDial {
    pub trunk: String,
    pub station: String,
    pub station_leg: CallLeg,
}

pub(crate) struct EventLoop {
    pub(crate) registry: Arc<Registry>,
    pub(crate) dial: DialCoordinator,
    pub(crate) notifier: Arc<dyn DeviceStateNotifier>,
    pub(crate) config: EngineConfig,
    rx: mpsc::Receiver<BlaEvent>,

    // Ephemeral records, owned exclusively by this task.
    pub(crate) ringing_trunks: Vec<RingingTrunk>,
    pub(crate) ringing_stations: Vec<RingingStation>,
    pub(crate) failed_stations: Vec<FailedStation>,
    pub(crate) pending_dials: Vec<PendingDial>,
}

impl EventLoop {
    pub(crate) fn new(
        registry: Arc<Registry>,
        dial: DialCoordinator,
        notifier: Arc<dyn DeviceStateNotifier>,
        config: EngineConfig,
        rx: mpsc::Receiver<BlaEvent>,
    ) -> Self {
        Self {
            registry,
            dial,
            notifier,
            config,
            rx,
            ringing_trunks: Vec::new(),
            ringing_stations: Vec::new(),
            failed_stations: Vec::new(),
            pending_dials: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("BLA event loop running");
        let mut deadline: Option<Instant> = None;

        loop {
            let received = match deadline {
                Some(at) => match tokio::time::timeout_at(at, self.rx.recv()).await {
                    Ok(event) => event,
                    // Timer fired: synthesize a ringing-trunk-changed event
                    // so timeout-driven changes interleave FIFO with
                    // externally-triggered ones.
                    Err(_) => Some(BlaEvent::RingingTrunkChanged),
                },
                None => self.rx.recv().await,
            };

            // Channel closed counts as a stop.
            let Some(mut event) = received else { break };

            // Drain the whole queue before recomputing timers.
            loop {
                if matches!(event, BlaEvent::Stop) {
                    self.shutdown();
                    return;
                }
                self.dispatch(event).await;
                match self.rx.try_recv() {
                    Ok(next) => event = next,
                    Err(_) => break,
                }
            }

            deadline = self.apply_schedule();
        }

        self.shutdown();
    }

    /// Re-run the scheduler until it has no more actions, applying each
    /// plan, and return the next wake deadline.
    fn apply_schedule(&mut self) -> Option<Instant> {
        loop {
            let now = Instant::now();
            let plan = scheduler::evaluate(
                &self.registry,
                &self.ringing_trunks,
                &self.ringing_stations,
                &self.failed_stations,
                self.config.failed_station_cooldown(),
                now,
            );
            if !plan.has_actions() {
                self.prune_failed_stations(now);
                return plan.next_wake.map(|wait| Instant::now() + wait);
            }

            for trunk in &plan.expired_trunks {
                self.expire_trunk(trunk);
            }
            for station in &plan.expired_stations {
                self.expire_station(station);
            }
            for candidate in &plan.start_ringing {
                self.start_ringing(&candidate.station, &candidate.trunk, now);
            }
            // Expiries and new rings changed state; evaluate again.
        }
    }

    /// Launch a ring attempt toward a station and record it
    fn start_ringing(&mut self, station: &str, trunk: &str, now: Instant) {
        match self.dial.ring_station(station, trunk) {
            Ok((attempt, cancel)) => {
                self.registry.with_station_mut(station, |s| {
                    s.dial_attempt = Some(attempt.clone());
                });
                self.ringing_stations.push(RingingStation {
                    station: station.to_string(),
                    attempt,
                    began: now,
                    cancel: Some(cancel),
                });
            }
            Err(e) => {
                warn!("Could not start ringing station '{}': {}", station, e);
                self.failed_stations.push(FailedStation {
                    station: station.to_string(),
                    failed_at: now,
                });
            }
        }
    }

    /// Drop failure records whose cooldown has fully lapsed
    fn prune_failed_stations(&mut self, now: Instant) {
        let cooldown = self.config.failed_station_cooldown();
        self.failed_stations
            .retain(|f| now.saturating_duration_since(f.failed_at) < cooldown);
    }

    /// Stop: release every ephemeral record. Dropping a ringing trunk's
    /// handshake unblocks its call task with an error; dropping a ringing
    /// station's cancel handle aborts its ring worker.
    fn shutdown(&mut self) {
        info!(
            "BLA event loop stopping ({} ringing trunks, {} ringing stations)",
            self.ringing_trunks.len(),
            self.ringing_stations.len()
        );
        for station in self.ringing_stations.drain(..) {
            self.registry.with_station_mut(&station.station, |s| {
                s.dial_attempt = None;
            });
        }
        self.ringing_trunks.clear();
        self.failed_stations.clear();
        self.pending_dials.clear();
    }
}
