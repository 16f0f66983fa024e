//! Ring/timeout scheduler
//!
//! Pure computation over the current ringing sets: which idle stations
//! should start ringing now, which ringing trunks/stations have exceeded
//! their timeout, and the minimum wait until the next such event. The
//! coordinator event loop invokes this whenever the ringing sets change and
//! again on every timer wakeup; the returned plan is applied by the loop,
//! never here.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::api::types::{AttemptId, DialStatus};
use crate::handshake::HandshakeReply;
use crate::registry::Registry;

/// Ephemeral record for a trunk with an unanswered inbound call
#[derive(Debug)]
pub struct RingingTrunk {
    pub trunk: String,
    pub began: Instant,
    /// Stations that already timed out for this ringing episode; they are
    /// skipped, not re-rung, until the next distinct episode.
    pub timed_out_stations: Vec<String>,
    /// Reply handle for the blocked trunk call task; answered with a status
    /// when the episode resolves.
    pub done: Option<HandshakeReply<DialStatus>>,
}

impl RingingTrunk {
    pub fn new(trunk: impl Into<String>, began: Instant, done: HandshakeReply<DialStatus>) -> Self {
        Self {
            trunk: trunk.into(),
            began,
            timed_out_stations: Vec::new(),
            done: Some(done),
        }
    }
}

/// Ephemeral record for a station with an outstanding ring attempt
#[derive(Debug)]
pub struct RingingStation {
    pub station: String,
    pub attempt: AttemptId,
    pub began: Instant,
    /// Dropping (or firing) this cancels the ring worker.
    pub cancel: Option<oneshot::Sender<()>>,
}

/// Short-lived record of a station that failed to answer; it is not
/// re-dialed inside the cooldown window.
#[derive(Debug, Clone)]
pub struct FailedStation {
    pub station: String,
    pub failed_at: Instant,
}

/// One (station, trunk) pair that should start ringing now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingCandidate {
    pub station: String,
    pub trunk: String,
}

/// The scheduler's verdict, applied by the coordinator
#[derive(Debug, Default)]
pub struct SchedulerPlan {
    pub start_ringing: Vec<RingCandidate>,
    /// Ringing trunks past their configured ring timeout
    pub expired_trunks: Vec<String>,
    /// Ringing stations past their effective ring timeout
    pub expired_stations: Vec<String>,
    /// Minimum wait until the next timer-driven event, `None` when nothing
    /// is pending.
    pub next_wake: Option<Duration>,
}

impl SchedulerPlan {
    fn note_wake(&mut self, wait: Duration) {
        match self.next_wake {
            Some(current) if current <= wait => {}
            _ => self.next_wake = Some(wait),
        }
    }

    /// Whether applying this plan changes any state
    pub fn has_actions(&self) -> bool {
        !self.start_ringing.is_empty()
            || !self.expired_trunks.is_empty()
            || !self.expired_stations.is_empty()
    }
}

/// Compute the current plan
///
/// Reads the registry and the coordinator's ephemeral lists; mutates
/// nothing.
pub fn evaluate(
    registry: &Registry,
    ringing_trunks: &[RingingTrunk],
    ringing_stations: &[RingingStation],
    failed_stations: &[FailedStation],
    failed_cooldown: Duration,
    now: Instant,
) -> SchedulerPlan {
    let mut plan = SchedulerPlan::default();

    calc_trunk_timeouts(registry, ringing_trunks, now, &mut plan);
    calc_station_timeouts(registry, ringing_trunks, ringing_stations, now, &mut plan);
    calc_station_delays(
        registry,
        ringing_trunks,
        ringing_stations,
        failed_stations,
        failed_cooldown,
        now,
        &mut plan,
    );

    plan
}

/// Trunk ring-timeout: elapsed since ring began vs. the trunk's configured
/// timeout.
fn calc_trunk_timeouts(
    registry: &Registry,
    ringing_trunks: &[RingingTrunk],
    now: Instant,
    plan: &mut SchedulerPlan,
) {
    for ringing in ringing_trunks {
        let Some(timeout) = registry
            .with_trunk(&ringing.trunk, |t| t.ring_timeout)
            .flatten()
        else {
            continue; // unlimited
        };
        let elapsed = now.saturating_duration_since(ringing.began);
        if elapsed >= timeout {
            plan.expired_trunks.push(ringing.trunk.clone());
        } else {
            plan.note_wake(timeout - elapsed);
        }
    }
}

/// Station ring-timeout: the effective timeout is the maximum of the
/// per-(station,trunk) overrides for trunks currently ringing at the
/// station, bounded by the station's own global timeout — whichever
/// constraint expires first wins.
fn calc_station_timeouts(
    registry: &Registry,
    ringing_trunks: &[RingingTrunk],
    ringing_stations: &[RingingStation],
    now: Instant,
    plan: &mut SchedulerPlan,
) {
    for ringing in ringing_stations {
        let Some(effective) =
            effective_station_timeout(registry, &ringing.station, ringing_trunks)
        else {
            continue; // ring forever
        };
        let elapsed = now.saturating_duration_since(ringing.began);
        if elapsed >= effective {
            plan.expired_stations.push(ringing.station.clone());
        } else {
            plan.note_wake(effective - elapsed);
        }
    }
}

fn effective_station_timeout(
    registry: &Registry,
    station: &str,
    ringing_trunks: &[RingingTrunk],
) -> Option<Duration> {
    registry
        .with_station(station, |s| {
            let override_max = s
                .trunk_refs
                .iter()
                .filter(|r| ringing_trunks.iter().any(|rt| rt.trunk == r.trunk))
                .filter_map(|r| r.ring_timeout)
                .max();
            match (override_max, s.ring_timeout) {
                (Some(o), Some(g)) => Some(o.min(g)),
                (Some(o), None) => Some(o),
                (None, Some(g)) => Some(g),
                (None, None) => None,
            }
        })
        .flatten()
}

/// Ring eligibility: for each ringing trunk, each subscribed station not
/// already ringing, not in a call, not cooling down after a failure and not
/// already timed out for this episode becomes eligible once its ring delay
/// has elapsed.
fn calc_station_delays(
    registry: &Registry,
    ringing_trunks: &[RingingTrunk],
    ringing_stations: &[RingingStation],
    failed_stations: &[FailedStation],
    failed_cooldown: Duration,
    now: Instant,
    plan: &mut SchedulerPlan,
) {
    for ringing in ringing_trunks {
        for station_name in registry.trunk_stations(&ringing.trunk) {
            if plan
                .start_ringing
                .iter()
                .any(|c| c.station == station_name)
            {
                continue; // already picked for an earlier trunk this pass
            }
            if ringing_stations.iter().any(|rs| rs.station == station_name) {
                continue;
            }
            if ringing.timed_out_stations.contains(&station_name) {
                continue;
            }
            if let Some(failed) = failed_stations
                .iter()
                .find(|f| f.station == station_name)
            {
                let since = now.saturating_duration_since(failed.failed_at);
                if since < failed_cooldown {
                    plan.note_wake(failed_cooldown - since);
                    continue;
                }
            }

            let Some(delay) = registry.with_station(&station_name, |s| {
                if s.in_call() {
                    return None;
                }
                let pair_delay = s
                    .trunk_ref(&ringing.trunk)
                    .and_then(|r| r.ring_delay)
                    .unwrap_or(Duration::ZERO);
                let station_delay = s.ring_delay.unwrap_or(Duration::ZERO);
                Some(pair_delay.max(station_delay))
            }) else {
                continue; // unknown station
            };
            let Some(delay) = delay else {
                continue; // station is busy in a call
            };

            let elapsed = now.saturating_duration_since(ringing.began);
            if elapsed >= delay {
                plan.start_ringing.push(RingCandidate {
                    station: station_name,
                    trunk: ringing.trunk.clone(),
                });
            } else {
                plan.note_wake(delay - elapsed);
            }
        }
    }
}

/// Tie-break when several trunks ring one station at once: the station
/// answers by subscription order, not arrival time.
pub fn choose_ringing_trunk(
    registry: &Registry,
    station: &str,
    ringing_trunks: &[RingingTrunk],
) -> Option<String> {
    registry
        .with_station(station, |s| {
            s.trunk_refs
                .iter()
                .map(|r| r.trunk.clone())
                .find(|name| ringing_trunks.iter().any(|rt| &rt.trunk == name))
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::TrunkRefState;
    use crate::config::BlaConfig;
    use crate::handshake;
    use pretty_assertions::assert_eq;

    const COOLDOWN: Duration = Duration::from_millis(1000);

    fn registry() -> Registry {
        Registry::from_config(
            &BlaConfig::from_toml(
                r#"
                [[trunks]]
                name = "t1"
                device = "SIP/t1"
                ring_timeout = 10

                [[trunks]]
                name = "t2"
                device = "SIP/t2"

                [[stations]]
                name = "a"
                device = "SIP/a"
                trunks = ["t1", "t2"]

                [[stations]]
                name = "b"
                device = "SIP/b"
                ring_delay = 5
                ring_timeout = 20
                trunks = [{ name = "t1", ring_timeout = 6 }, "t2"]
                "#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn ringing_trunk(name: &str, began: Instant) -> RingingTrunk {
        let (reply, _wait) = handshake::pair();
        // The wait half is dropped; these tests never resolve the episode.
        RingingTrunk::new(name, began, reply)
    }

    #[test]
    fn test_zero_delay_station_rings_immediately() {
        let registry = registry();
        let now = Instant::now();
        let trunks = [ringing_trunk("t1", now)];

        let plan = evaluate(&registry, &trunks, &[], &[], COOLDOWN, now);
        assert_eq!(
            plan.start_ringing,
            vec![RingCandidate {
                station: "a".into(),
                trunk: "t1".into()
            }]
        );
        // Station b waits out its 5s delay.
        assert_eq!(plan.next_wake, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_delayed_station_becomes_eligible() {
        let registry = registry();
        let began = Instant::now();
        let trunks = [ringing_trunk("t1", began)];
        let now = began + Duration::from_secs(5);

        let plan = evaluate(&registry, &trunks, &[], &[], COOLDOWN, now);
        let stations: Vec<_> = plan.start_ringing.iter().map(|c| c.station.as_str()).collect();
        assert_eq!(stations, vec!["a", "b"]);
    }

    #[test]
    fn test_trunk_timeout_boundary_arithmetic() {
        let registry = registry();
        let began = Instant::now();
        let trunks = [ringing_trunk("t1", began)];

        // 1ms before the 10s timeout: not expired, next wake ~1ms.
        let plan = evaluate(
            &registry,
            &trunks,
            &[],
            &[],
            COOLDOWN,
            began + Duration::from_millis(9_999),
        );
        assert!(plan.expired_trunks.is_empty());
        assert_eq!(plan.next_wake, Some(Duration::from_millis(1)));

        // 1ms past: expired.
        let plan = evaluate(
            &registry,
            &trunks,
            &[],
            &[],
            COOLDOWN,
            began + Duration::from_millis(10_001),
        );
        assert_eq!(plan.expired_trunks, vec!["t1"]);
    }

    #[test]
    fn test_unlimited_trunk_never_expires() {
        let registry = registry();
        let began = Instant::now();
        let trunks = [ringing_trunk("t2", began)];

        let plan = evaluate(
            &registry,
            &trunks,
            &[],
            &[],
            COOLDOWN,
            began + Duration::from_secs(3600),
        );
        assert!(plan.expired_trunks.is_empty());
    }

    #[test]
    fn test_station_timeout_uses_first_expiring_constraint() {
        let registry = registry();
        let began = Instant::now();
        // Station b ringing for t1: pair override 6s, global 20s -> 6s wins.
        let trunks = [ringing_trunk("t1", began)];
        let stations = [RingingStation {
            station: "b".into(),
            attempt: AttemptId::new(),
            began,
            cancel: None,
        }];

        let plan = evaluate(
            &registry,
            &trunks,
            &stations,
            &[],
            COOLDOWN,
            began + Duration::from_millis(5_999),
        );
        assert!(plan.expired_stations.is_empty());
        assert_eq!(plan.next_wake, Some(Duration::from_millis(1)));

        let plan = evaluate(
            &registry,
            &trunks,
            &stations,
            &[],
            COOLDOWN,
            began + Duration::from_secs(6),
        );
        assert_eq!(plan.expired_stations, vec!["b"]);
    }

    #[test]
    fn test_timed_out_station_not_rerung_for_same_episode() {
        let registry = registry();
        let began = Instant::now();
        let mut trunk = ringing_trunk("t1", began);
        trunk.timed_out_stations.push("a".into());
        let trunks = [trunk];

        // Re-evaluated repeatedly, station a never becomes eligible again.
        for offset in [0u64, 1, 30, 600] {
            let plan = evaluate(
                &registry,
                &trunks,
                &[],
                &[],
                COOLDOWN,
                began + Duration::from_secs(offset),
            );
            assert!(
                !plan.start_ringing.iter().any(|c| c.station == "a"),
                "station a re-rung at +{offset}s"
            );
        }
    }

    #[test]
    fn test_failed_station_cooldown_window() {
        let registry = registry();
        let began = Instant::now();
        let trunks = [ringing_trunk("t1", began)];
        let failed = [FailedStation {
            station: "a".into(),
            failed_at: began,
        }];

        let plan = evaluate(
            &registry,
            &trunks,
            &[],
            &failed,
            COOLDOWN,
            began + Duration::from_millis(500),
        );
        assert!(!plan.start_ringing.iter().any(|c| c.station == "a"));
        // Re-check when the cooldown lapses.
        assert_eq!(plan.next_wake, Some(Duration::from_millis(500)));

        let plan = evaluate(
            &registry,
            &trunks,
            &[],
            &failed,
            COOLDOWN,
            began + Duration::from_millis(1000),
        );
        assert!(plan.start_ringing.iter().any(|c| c.station == "a"));
    }

    #[test]
    fn test_station_in_call_not_rung() {
        let registry = registry();
        registry.with_station_mut("a", |s| {
            let r = s.trunk_ref_mut("t2").unwrap();
            r.state = TrunkRefState::Up;
            r.call_leg = Some(crate::api::types::CallLeg::new("SIP/a"));
        });
        let now = Instant::now();
        let trunks = [ringing_trunk("t1", now)];

        let plan = evaluate(&registry, &trunks, &[], &[], COOLDOWN, now);
        assert!(!plan.start_ringing.iter().any(|c| c.station == "a"));
    }

    #[test]
    fn test_tie_break_is_subscription_order() {
        let registry = registry();
        let now = Instant::now();
        // t2 began ringing before t1, but station a lists t1 first.
        let trunks = [
            ringing_trunk("t2", now - Duration::from_secs(5)),
            ringing_trunk("t1", now),
        ];
        assert_eq!(
            choose_ringing_trunk(&registry, "a", &trunks),
            Some("t1".to_string())
        );
    }

    #[test]
    fn test_no_pending_timers_means_no_wake() {
        let registry = registry();
        let plan = evaluate(&registry, &[], &[], &[], COOLDOWN, Instant::now());
        assert_eq!(plan.next_wake, None);
        assert!(!plan.has_actions());
    }
}
