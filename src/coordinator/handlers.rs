//! Event handlers for the coordinator loop
//!
//! Every state transition of a trunk or station happens here, on the loop
//! task, strictly in event arrival order. Handlers reply to blocked call
//! tasks only after the transition is fully applied, so a resumed task
//! always observes consistent state.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::types::{CallLeg, DialStatus, TrunkRefState};
use crate::config::BlaConfig;
use crate::dial::primitive::DialState;
use crate::errors::BlaError;
use crate::events::{BlaEvent, DialStateUpdate, LegRole, OffHookDecision, RaceVerdict};
use crate::handshake::HandshakeReply;
use crate::scheduler::{self, FailedStation, RingingTrunk};

use super::event_loop::{EventLoop, PendingDial};

impl EventLoop {
    pub(super) async fn dispatch(&mut self, event: BlaEvent) {
        match event {
            BlaEvent::Hold { station, trunk } => self.handle_hold(&station, &trunk),
            BlaEvent::DialState(update) => self.handle_dial_state(update),
            // Only meaningful as a wakeup; the scheduler runs after every
            // batch regardless.
            BlaEvent::RingingTrunkChanged => {}
            BlaEvent::TrunkRinging { trunk, leg, done } => {
                self.handle_trunk_ringing(trunk, leg, done);
            }
            BlaEvent::OffHook {
                station,
                leg,
                trunk,
                reply,
            } => self.handle_off_hook(station, leg, trunk, reply),
            BlaEvent::Reload { config, reply } => self.handle_reload(config, reply),
            // Intercepted by the run loop before dispatch.
            BlaEvent::Stop => {}
        }
    }

    // ---- inbound ring ----

    fn handle_trunk_ringing(
        &mut self,
        trunk: String,
        leg: CallLeg,
        done: HandshakeReply<DialStatus>,
    ) {
        let pending = self.pending_dials.iter().any(|p| p.trunk == trunk);
        let seized = self.registry.with_trunk_mut(&trunk, |t| {
            if pending || t.call_leg.is_some() || t.on_hold {
                false
            } else {
                t.call_leg = Some(leg);
                true
            }
        });

        match seized {
            None => {
                warn!("Inbound ring on unknown trunk '{}'", trunk);
                let _ = done.reply(DialStatus::Failure);
            }
            Some(false) => {
                warn!("Inbound ring on busy trunk '{}'", trunk);
                let _ = done.reply(DialStatus::Failure);
            }
            Some(true) => {
                info!("Trunk '{}' ringing", trunk);
                self.fanout_trunk_state(&trunk, TrunkRefState::Ringing, true, None);
                self.ringing_trunks
                    .push(RingingTrunk::new(trunk, Instant::now(), done));
            }
        }
    }

    // ---- station off-hook ----

    fn handle_off_hook(
        &mut self,
        station: String,
        leg: CallLeg,
        requested: Option<String>,
        reply: HandshakeReply<OffHookDecision>,
    ) {
        if !self.registry.has_station(&station) {
            warn!("Off-hook from unknown station '{}'", station);
            let _ = reply.reply(OffHookDecision::Congestion);
            return;
        }
        let candidates = match requested {
            Some(trunk) => vec![trunk],
            None => self.registry.station_trunks(&station),
        };

        // Resume a line this station itself put on hold.
        let own_held = candidates.iter().find(|trunk| {
            self.registry
                .with_station(&station, |s| {
                    s.trunk_ref(trunk)
                        .is_some_and(|r| r.state == TrunkRefState::OnHoldByMe)
                })
                .unwrap_or(false)
        });
        if let Some(trunk) = own_held.cloned() {
            self.resume_trunk(&station, &trunk, leg);
            let _ = reply.reply(OffHookDecision::Join { trunk });
            return;
        }

        // Answer a ringing line; subscription order breaks ties.
        let ringing =
            scheduler::choose_ringing_trunk(&self.registry, &station, &self.ringing_trunks)
                .filter(|trunk| candidates.contains(trunk));
        if let Some(trunk) = ringing {
            self.answer_ringing_trunk(&station, &trunk, leg);
            let _ = reply.reply(OffHookDecision::Join { trunk });
            return;
        }

        // Seize an idle line and dial out.
        let idle = candidates.iter().find(|trunk| {
            !self.pending_dials.iter().any(|p| &p.trunk == *trunk)
                && self
                    .registry
                    .with_trunk(trunk, |t| t.is_idle())
                    .unwrap_or(false)
        });
        if let Some(trunk) = idle.cloned() {
            self.pending_dials.push(PendingDial {
                trunk: trunk.clone(),
                station: station.clone(),
                station_leg: leg,
            });
            self.fanout_trunk_state(&trunk, TrunkRefState::Up, true, None);
            let _ = reply.reply(OffHookDecision::Dial { trunk });
            return;
        }

        // Retrieve a line another station put on hold, policy permitting.
        let held = candidates.iter().find(|trunk| {
            self.registry
                .with_trunk(trunk, |t| t.on_hold)
                .unwrap_or(false)
                && self.hold_retrievable(&station, trunk)
        });
        if let Some(trunk) = held.cloned() {
            self.resume_trunk(&station, &trunk, leg);
            let _ = reply.reply(OffHookDecision::Join { trunk });
            return;
        }

        // Barge into an active line.
        let bargeable = candidates.iter().find(|trunk| {
            self.registry
                .with_trunk(trunk, |t| {
                    t.call_leg.is_some() && !t.on_hold && !t.barge_disabled
                })
                .unwrap_or(false)
        });
        if let Some(trunk) = bargeable.cloned() {
            info!("Station '{}' barging into trunk '{}'", station, trunk);
            self.registry
                .with_trunk_mut(&trunk, |t| t.active_stations += 1);
            self.attach_station_leg(&station, &trunk, leg);
            let _ = reply.reply(OffHookDecision::Join { trunk });
            return;
        }

        debug!("No line available for station '{}'", station);
        let _ = reply.reply(OffHookDecision::Congestion);
    }

    /// Whether `station` may pick up the held `trunk`: both the trunk and
    /// the station that put it on hold must allow open retrieval.
    fn hold_retrievable(&self, station: &str, trunk: &str) -> bool {
        use crate::api::types::HoldPolicy;

        let trunk_open = self
            .registry
            .with_trunk(trunk, |t| t.hold_policy == HoldPolicy::Open)
            .unwrap_or(false);
        if !trunk_open {
            return false;
        }
        let holder = self.registry.trunk_stations(trunk).into_iter().find(|name| {
            self.registry
                .with_station(name, |s| {
                    s.trunk_ref(trunk)
                        .is_some_and(|r| r.state == TrunkRefState::OnHoldByMe)
                })
                .unwrap_or(false)
        });
        match holder {
            Some(holder) if holder != station => self
                .registry
                .with_station(&holder, |s| s.hold_policy == HoldPolicy::Open)
                .unwrap_or(false),
            // Holder unknown (swept by a reload): allow.
            _ => true,
        }
    }

    /// A station goes off-hook against a ringing trunk: resolve the episode
    /// in its favor before it joins the mix.
    fn answer_ringing_trunk(&mut self, station: &str, trunk: &str, leg: CallLeg) {
        info!("Station '{}' answering ringing trunk '{}'", station, trunk);
        self.resolve_ringing_trunk(trunk, DialStatus::Success);
        self.registry
            .with_trunk_mut(trunk, |t| t.active_stations += 1);
        self.attach_station_leg(station, trunk, leg);
        self.fanout_trunk_state(trunk, TrunkRefState::Up, true, None);

        // An outbound ring attempt toward the answering station is moot now.
        if let Some(pos) = self
            .ringing_stations
            .iter()
            .position(|r| r.station == station)
        {
            self.ringing_stations.remove(pos);
        }
        self.registry
            .with_station_mut(station, |s| s.dial_attempt = None);
        self.prune_orphan_ringing_stations();
    }

    /// Take a held (or holding) trunk back off hold and attach the station
    fn resume_trunk(&mut self, station: &str, trunk: &str, leg: CallLeg) {
        info!("Station '{}' resuming held trunk '{}'", station, trunk);
        self.registry.with_trunk_mut(trunk, |t| {
            t.on_hold = false;
            t.hold_stations = t.hold_stations.saturating_sub(1);
            t.active_stations += 1;
        });
        self.attach_station_leg(station, trunk, leg);
        self.fanout_trunk_state(trunk, TrunkRefState::Up, true, None);
    }

    // ---- hold ----

    fn handle_hold(&mut self, station: &str, trunk: &str) {
        let ref_state = self
            .registry
            .with_station(station, |s| s.trunk_ref(trunk).map(|r| r.state))
            .flatten();

        match ref_state {
            Some(TrunkRefState::Up) => {
                info!("Station '{}' holding trunk '{}'", station, trunk);
                self.registry.with_trunk_mut(trunk, |t| {
                    t.on_hold = true;
                    t.hold_stations += 1;
                    t.active_stations = t.active_stations.saturating_sub(1);
                });
                self.set_ref_state(station, trunk, TrunkRefState::OnHoldByMe);
                self.fanout_trunk_state(trunk, TrunkRefState::OnHold, true, Some(station));
            }
            // Toggle: un-hold while the station leg is still up.
            Some(TrunkRefState::OnHoldByMe) => {
                let leg = self
                    .registry
                    .with_station(station, |s| {
                        s.trunk_ref(trunk).and_then(|r| r.call_leg.clone())
                    })
                    .flatten();
                match leg {
                    Some(leg) => self.resume_trunk(station, trunk, leg),
                    None => warn!(
                        "Station '{}' cannot resume trunk '{}' without a leg; go off-hook",
                        station, trunk
                    ),
                }
            }
            _ => warn!(
                "Hold from station '{}' ignored; not joined to trunk '{}'",
                station, trunk
            ),
        }
    }

    // ---- dial-state reports ----

    fn handle_dial_state(&mut self, update: DialStateUpdate) {
        match update.role {
            LegRole::Trunk => match update.state {
                DialState::Answered => self.handle_trunk_answered(update),
                state if state.is_terminal() => {
                    if update.station.is_some() {
                        // A dial that never produced a trunk leg; releases
                        // the grant if one is still recorded, and is a no-op
                        // for a report that arrives after the grant is gone.
                        self.revert_failed_dial(&update.trunk, state);
                    } else {
                        self.handle_trunk_hangup(&update.trunk);
                    }
                }
                // Intermediate trunk states are consumed by the dial worker.
                _ => {}
            },
            LegRole::Station => match update.state {
                DialState::Answered if update.verdict.is_some() => {
                    self.handle_station_answered(update);
                }
                // A joined station's leg left the conference.
                DialState::Hangup if update.attempt.is_none() => {
                    if let Some(station) = &update.station {
                        self.handle_station_hangup(station, &update.trunk);
                    }
                }
                state if state.is_terminal() => self.handle_station_ring_failed(update),
                _ => {}
            },
        }
    }

    /// An outbound dial connected: attach the trunk leg and the dialing
    /// station's own leg.
    fn handle_trunk_answered(&mut self, update: DialStateUpdate) {
        let Some(pos) = self
            .pending_dials
            .iter()
            .position(|p| p.trunk == update.trunk)
        else {
            warn!(
                "Answer on trunk '{}' with no pending dial; ignoring",
                update.trunk
            );
            return;
        };
        let pending = self.pending_dials.remove(pos);

        self.registry.with_trunk_mut(&update.trunk, |t| {
            t.call_leg = update.answered.clone();
            t.active_stations += 1;
        });
        self.attach_station_leg(&pending.station, &update.trunk, pending.station_leg);
        self.fanout_trunk_state(&update.trunk, TrunkRefState::Up, true, None);
        info!(
            "Trunk '{}' up for station '{}'",
            update.trunk, pending.station
        );
    }

    /// An outbound dial ended without a trunk leg: release the seizure.
    fn revert_failed_dial(&mut self, trunk: &str, state: DialState) {
        let Some(pos) = self.pending_dials.iter().position(|p| p.trunk == trunk) else {
            return;
        };
        let pending = self.pending_dials.remove(pos);
        warn!(
            "Outbound dial on trunk '{}' for station '{}' ended: {:?}",
            trunk, pending.station, state
        );
        self.set_ref_state(&pending.station, trunk, TrunkRefState::Idle);
        self.fanout_trunk_state(trunk, TrunkRefState::Idle, true, None);
    }

    /// The trunk's live leg is gone: tear the whole line down.
    fn handle_trunk_hangup(&mut self, trunk: &str) {
        if self.registry.with_trunk(trunk, |_| ()).is_none() {
            warn!("Hangup on unknown trunk '{}'", trunk);
            return;
        }
        // An unanswered inbound episode ends as a failure (caller abandoned).
        self.resolve_ringing_trunk(trunk, DialStatus::Failure);

        self.registry.with_trunk_mut(trunk, |t| {
            t.call_leg = None;
            t.on_hold = false;
            t.active_stations = 0;
            t.hold_stations = 0;
        });
        self.pending_dials.retain(|p| p.trunk != trunk);
        self.fanout_trunk_state(trunk, TrunkRefState::Idle, false, None);
        self.prune_orphan_ringing_stations();
        info!("Trunk '{}' idle", trunk);
    }

    /// A rung station answered: pick the winner atomically with removing the
    /// ringing-trunk record, so exactly one answerer gets each trunk.
    fn handle_station_answered(&mut self, update: DialStateUpdate) {
        let (Some(station), Some(verdict)) = (update.station, update.verdict) else {
            return;
        };
        let Some(pos) = self
            .ringing_stations
            .iter()
            .position(|r| update.attempt.as_ref() == Some(&r.attempt))
        else {
            // Attempt already cancelled or timed out; too late.
            debug!("Stale answer from station '{}'", station);
            let _ = verdict.reply(RaceVerdict::Lost);
            return;
        };
        self.ringing_stations.remove(pos);
        self.registry
            .with_station_mut(&station, |s| s.dial_attempt = None);

        let chosen =
            scheduler::choose_ringing_trunk(&self.registry, &station, &self.ringing_trunks);
        let Some(trunk) = chosen else {
            // Every ringing trunk was already claimed.
            info!("Station '{}' answered too late; hanging up", station);
            let _ = verdict.reply(RaceVerdict::Lost);
            return;
        };

        info!("Station '{}' answered trunk '{}'", station, trunk);
        self.resolve_ringing_trunk(&trunk, DialStatus::Success);
        let bridge_profile = self
            .registry
            .with_trunk_mut(&trunk, |t| {
                t.active_stations += 1;
                t.bridge_profile.clone()
            })
            .unwrap_or_default();
        if let Some(leg) = update.answered {
            self.attach_station_leg(&station, &trunk, leg);
        }
        self.fanout_trunk_state(&trunk, TrunkRefState::Up, true, None);
        self.prune_orphan_ringing_stations();

        let _ = verdict.reply(RaceVerdict::Won {
            trunk,
            bridge_profile,
        });
    }

    /// A ring attempt ended without an answer; back off before retrying.
    fn handle_station_ring_failed(&mut self, update: DialStateUpdate) {
        let Some(pos) = self
            .ringing_stations
            .iter()
            .position(|r| update.attempt.as_ref() == Some(&r.attempt))
        else {
            return;
        };
        let record = self.ringing_stations.remove(pos);
        self.registry
            .with_station_mut(&record.station, |s| s.dial_attempt = None);
        debug!(
            "Ring attempt for station '{}' ended: {:?}",
            record.station, update.state
        );
        self.failed_stations.push(FailedStation {
            station: record.station,
            failed_at: Instant::now(),
        });
    }

    /// A joined station's own leg left the conference
    fn handle_station_hangup(&mut self, station: &str, trunk: &str) {
        let was = self
            .registry
            .with_station_mut(station, |s| {
                s.trunk_ref_mut(trunk).map(|r| {
                    let was = r.state;
                    r.call_leg = None;
                    if was == TrunkRefState::Up {
                        r.state = TrunkRefState::Idle;
                    }
                    was
                })
            })
            .flatten();

        if was == Some(TrunkRefState::Up) {
            self.notify_ref(station, trunk, TrunkRefState::Idle);
            self.registry.with_trunk_mut(trunk, |t| {
                t.active_stations = t.active_stations.saturating_sub(1);
            });
            info!("Station '{}' left trunk '{}'", station, trunk);
        }
        // OnHoldByMe keeps its state: the phone hangs up locally on hold.
    }

    // ---- reload ----

    fn handle_reload(
        &mut self,
        config: BlaConfig,
        reply: HandshakeReply<std::result::Result<(), BlaError>>,
    ) {
        self.registry.mark_all_for_reload();
        match self.registry.apply_config(&config) {
            Ok(()) => {
                let (trunks_gone, stations_gone) = self.registry.sweep_unmarked();
                self.config = config.engine.clone();
                if trunks_gone + stations_gone > 0 {
                    self.drop_swept_records();
                }
                info!(
                    "BLA configuration reloaded ({} trunks, {} stations removed)",
                    trunks_gone, stations_gone
                );
                let _ = reply.reply(Ok(()));
            }
            Err(e) => {
                warn!("BLA reload rejected: {}", e);
                let _ = reply.reply(Err(e));
            }
        }
    }

    /// Release ephemeral records that reference entities the reload removed
    fn drop_swept_records(&mut self) {
        let mut kept = Vec::with_capacity(self.ringing_trunks.len());
        for mut ringing in self.ringing_trunks.drain(..) {
            if self.registry.has_trunk(&ringing.trunk) {
                kept.push(ringing);
            } else if let Some(done) = ringing.done.take() {
                let _ = done.reply(DialStatus::Failure);
            }
        }
        self.ringing_trunks = kept;

        self.ringing_stations
            .retain(|r| self.registry.has_station(&r.station));
        self.failed_stations
            .retain(|f| self.registry.has_station(&f.station));
        self.pending_dials
            .retain(|p| self.registry.has_trunk(&p.trunk) && self.registry.has_station(&p.station));
    }

    // ---- timer expirations (applied from the scheduler plan) ----

    pub(super) fn expire_trunk(&mut self, trunk: &str) {
        info!("Ringing trunk '{}' timed out", trunk);
        self.resolve_ringing_trunk(trunk, DialStatus::RingTimeout);
        self.registry.with_trunk_mut(trunk, |t| t.call_leg = None);
        self.fanout_trunk_state(trunk, TrunkRefState::Idle, true, None);
        self.prune_orphan_ringing_stations();
    }

    pub(super) fn expire_station(&mut self, station: &str) {
        let Some(pos) = self
            .ringing_stations
            .iter()
            .position(|r| r.station == station)
        else {
            return;
        };
        // Dropping the record's cancel handle stops the ring worker.
        self.ringing_stations.remove(pos);
        self.registry
            .with_station_mut(station, |s| s.dial_attempt = None);

        // Skipped for the rest of every current episode, not forever.
        for ringing in &mut self.ringing_trunks {
            if !ringing.timed_out_stations.iter().any(|s| s == station) {
                ringing.timed_out_stations.push(station.to_string());
            }
        }
        info!("Station '{}' ring timed out", station);
    }

    // ---- shared transitions ----

    /// Remove a ringing-trunk record and wake its blocked call task
    fn resolve_ringing_trunk(&mut self, trunk: &str, status: DialStatus) {
        let Some(pos) = self.ringing_trunks.iter().position(|r| r.trunk == trunk) else {
            return;
        };
        let mut record = self.ringing_trunks.remove(pos);
        if let Some(done) = record.done.take() {
            let _ = done.reply(status);
        }
    }

    /// Cancel ring attempts whose station no longer has any ringing trunk
    fn prune_orphan_ringing_stations(&mut self) {
        let registry = &self.registry;
        let ringing_trunks = &self.ringing_trunks;
        self.ringing_stations.retain(|r| {
            let still_wanted =
                scheduler::choose_ringing_trunk(registry, &r.station, ringing_trunks).is_some();
            if !still_wanted {
                debug!("Cancelling ring attempt for station '{}'", r.station);
                registry.with_station_mut(&r.station, |s| s.dial_attempt = None);
            }
            still_wanted
        });
    }

    /// Attach a station's own live leg to a trunk it has joined
    fn attach_station_leg(&self, station: &str, trunk: &str, leg: CallLeg) {
        self.registry.with_station_mut(station, |s| {
            if let Some(r) = s.trunk_ref_mut(trunk) {
                r.state = TrunkRefState::Up;
                r.call_leg = Some(leg);
            }
        });
        self.notify_ref(station, trunk, TrunkRefState::Up);
    }

    /// Set one station's view of a trunk and publish the device state
    fn set_ref_state(&self, station: &str, trunk: &str, state: TrunkRefState) {
        let changed = self
            .registry
            .with_station_mut(station, |s| {
                s.trunk_ref_mut(trunk).is_some_and(|r| {
                    if r.state == state {
                        return false;
                    }
                    r.state = state;
                    if state == TrunkRefState::Idle {
                        r.call_leg = None;
                    }
                    true
                })
            })
            .unwrap_or(false);
        if changed {
            self.notify_ref(station, trunk, state);
        }
    }

    /// Propagate a trunk state to its subscribed stations' views
    ///
    /// With `inactive_only`, stations that have their own live leg on the
    /// trunk are left alone (they track their own transitions).
    fn fanout_trunk_state(
        &self,
        trunk: &str,
        state: TrunkRefState,
        inactive_only: bool,
        exclude: Option<&str>,
    ) {
        for station in self.registry.trunk_stations(trunk) {
            if exclude == Some(station.as_str()) {
                continue;
            }
            if inactive_only {
                let active = self
                    .registry
                    .with_station(&station, |s| {
                        s.trunk_ref(trunk).is_some_and(|r| r.call_leg.is_some())
                    })
                    .unwrap_or(false);
                if active {
                    continue;
                }
            }
            self.set_ref_state(&station, trunk, state);
        }
    }

    fn notify_ref(&self, station: &str, trunk: &str, state: TrunkRefState) {
        self.notifier
            .notify(&format!("{station}_{trunk}"), state.into());
    }
}
