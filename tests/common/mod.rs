//! Scripted implementations of the external collaborator traits
//!
//! Tests steer every outbound call attempt through an `AttemptHandle` and
//! observe conference membership and device-state publication through the
//! mock mixer and notifier.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

use bla_core::api::types::{CallLeg, CallLegId, DeviceState};
use bla_core::config::BlaConfig;
use bla_core::coordinator::BlaCoordinator;
use bla_core::dial::primitive::{
    DeviceStateNotifier, DialApi, DialAttempt, DialState, Indication, Mixer,
};
use bla_core::errors::{BlaError, Result};

/// Run every ready task to completion without advancing the clock
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn config(toml: &str) -> BlaConfig {
    BlaConfig::from_toml(toml).expect("test config must parse")
}

pub struct Fixture {
    pub coordinator: Arc<BlaCoordinator>,
    pub dial: Arc<MockDialApi>,
    pub mixer: Arc<MockMixer>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn start(config: BlaConfig) -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dial = Arc::new(MockDialApi::default());
    let mixer = Arc::new(MockMixer::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = BlaCoordinator::new(
        config,
        dial.clone(),
        mixer.clone(),
        notifier.clone(),
    )
    .expect("coordinator must start");
    Fixture {
        coordinator,
        dial,
        mixer,
        notifier,
    }
}

// ---- dial API ----

struct PlannedAttempt {
    rx: mpsc::UnboundedReceiver<DialState>,
    cancelled: Arc<AtomicBool>,
}

/// Test-side handle steering one planned outbound attempt
pub struct AttemptHandle {
    tx: mpsc::UnboundedSender<DialState>,
    cancelled: Arc<AtomicBool>,
}

impl AttemptHandle {
    pub fn push(&self, state: DialState) {
        let _ = self.tx.send(state);
    }

    pub fn answer(&self) {
        self.push(DialState::Ringing);
        self.push(DialState::Answered);
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockDialApi {
    planned: Mutex<HashMap<String, VecDeque<PlannedAttempt>>>,
    dialed: Mutex<Vec<String>>,
    hangups: Mutex<Vec<CallLeg>>,
}

impl MockDialApi {
    /// Queue an attempt for the next dial toward `device`; unplanned dials
    /// fail immediately.
    pub fn expect_dial(&self, device: &str) -> AttemptHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.planned
            .lock()
            .unwrap()
            .entry(device.to_string())
            .or_default()
            .push_back(PlannedAttempt {
                rx,
                cancelled: cancelled.clone(),
            });
        AttemptHandle { tx, cancelled }
    }

    pub fn dial_count(&self, device: &str) -> usize {
        self.dialed
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.as_str() == device)
            .count()
    }

    pub fn hangup_count(&self) -> usize {
        self.hangups.lock().unwrap().len()
    }

    pub fn hung_up(&self, device: &str) -> bool {
        self.hangups
            .lock()
            .unwrap()
            .iter()
            .any(|leg| leg.device == device)
    }
}

#[async_trait]
impl DialApi for MockDialApi {
    async fn dial(
        &self,
        tech: &str,
        address: &str,
        _originator: Option<&CallLeg>,
    ) -> Result<Box<dyn DialAttempt>> {
        let device = if tech.is_empty() {
            address.to_string()
        } else {
            format!("{tech}/{address}")
        };
        self.dialed.lock().unwrap().push(device.clone());
        let planned = self
            .planned
            .lock()
            .unwrap()
            .get_mut(&device)
            .and_then(|queue| queue.pop_front());
        match planned {
            Some(p) => Ok(Box::new(MockAttempt {
                device,
                rx: p.rx,
                cancelled: p.cancelled,
                last: DialState::Trying,
            })),
            None => Err(BlaError::DialFailed(format!(
                "no planned attempt for {device}"
            ))),
        }
    }

    async fn indicate(&self, _leg: &CallLeg, _indication: Indication) {}

    async fn hangup(&self, leg: &CallLeg) {
        self.hangups.lock().unwrap().push(leg.clone());
    }
}

struct MockAttempt {
    device: String,
    rx: mpsc::UnboundedReceiver<DialState>,
    cancelled: Arc<AtomicBool>,
    last: DialState,
}

#[async_trait]
impl DialAttempt for MockAttempt {
    async fn next_state(&mut self) -> Option<DialState> {
        let state = self.rx.recv().await?;
        self.last = state;
        Some(state)
    }

    fn state(&self) -> DialState {
        self.last
    }

    fn answered_leg(&self) -> Option<CallLeg> {
        (self.last == DialState::Answered).then(|| CallLeg::new(self.device.clone()))
    }

    async fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}

// ---- mixer ----

#[derive(Debug, Clone)]
pub struct JoinedLeg {
    pub leg: CallLeg,
    pub conference: String,
    pub user_profile: String,
    pub bridge_profile: String,
}

#[derive(Default)]
struct MixerInner {
    joined: Vec<JoinedLeg>,
    releases: HashMap<CallLegId, Arc<Notify>>,
    history: Vec<JoinedLeg>,
}

/// Mixer whose `join` blocks until the test kicks the leg back out
#[derive(Default)]
pub struct MockMixer {
    inner: Mutex<MixerInner>,
}

impl MockMixer {
    pub fn joined_in(&self, conference: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .joined
            .iter()
            .filter(|j| j.conference == conference)
            .count()
    }

    pub fn ever_joined(&self, conference: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|j| j.conference == conference)
            .count()
    }

    /// End one leg's conference membership
    pub fn kick(&self, leg: &CallLegId) {
        if let Some(release) = self.inner.lock().unwrap().releases.get(leg) {
            release.notify_one();
        }
    }

    /// End every call in progress
    pub fn kick_all(&self) {
        for release in self.inner.lock().unwrap().releases.values() {
            release.notify_one();
        }
    }
}

#[async_trait]
impl Mixer for MockMixer {
    async fn join(
        &self,
        leg: &CallLeg,
        conference: &str,
        user_profile: &str,
        bridge_profile: &str,
    ) -> Result<()> {
        let joined = JoinedLeg {
            leg: leg.clone(),
            conference: conference.to_string(),
            user_profile: user_profile.to_string(),
            bridge_profile: bridge_profile.to_string(),
        };
        let release = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().unwrap();
            inner.joined.push(joined.clone());
            inner.history.push(joined);
            inner.releases.insert(leg.id.clone(), release.clone());
        }

        release.notified().await;

        let mut inner = self.inner.lock().unwrap();
        inner.joined.retain(|j| j.leg.id != leg.id);
        inner.releases.remove(&leg.id);
        Ok(())
    }
}

// ---- device-state notifier ----

#[derive(Default)]
pub struct RecordingNotifier {
    states: Mutex<Vec<(String, DeviceState)>>,
}

impl RecordingNotifier {
    /// Most recent state published for a `station_trunk` key
    pub fn last_for(&self, key: &str) -> Option<DeviceState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, s)| *s)
    }
}

impl DeviceStateNotifier for RecordingNotifier {
    fn notify(&self, key: &str, state: DeviceState) {
        self.states.lock().unwrap().push((key.to_string(), state));
    }
}
