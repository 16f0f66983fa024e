//! Station off-hook flows: seizing a line and dialing out, answering a
//! ringing line by going off-hook, barge-in and congestion.

mod common;

use bla_core::api::types::{CallLeg, DeviceState, DialStatus};
use bla_core::dial::primitive::DialState;
use common::{config, settle, start};

fn two_station_config() -> bla_core::config::BlaConfig {
    config(
        r#"
        [[trunks]]
        name = "line1"
        device = "SIP/line1"

        [[stations]]
        name = "desk-a"
        device = "SIP/1001"
        trunks = ["line1"]

        [[stations]]
        name = "desk-b"
        device = "SIP/1002"
        trunks = ["line1"]
        "#,
    )
}

#[tokio::test(start_paused = true)]
async fn test_off_hook_dials_idle_trunk() {
    let f = start(two_station_config());
    let trunk = f.dial.expect_dial("SIP/line1");

    let coordinator = f.coordinator.clone();
    let leg = CallLeg::new("SIP/1001-leg");
    let station_task =
        tokio::spawn(async move { coordinator.station_off_hook("desk-a", leg, None).await });
    settle().await;

    // The seizure is visible to the other station before the far end answers.
    assert_eq!(f.dial.dial_count("SIP/line1"), 1);
    assert_eq!(
        f.notifier.last_for("desk-b_line1"),
        Some(DeviceState::InUse)
    );

    trunk.push(DialState::Ringing);
    trunk.push(DialState::Answered);
    settle().await;

    // Trunk leg and the dialing station share the conference.
    assert_eq!(f.mixer.joined_in("line1"), 2);
    let snapshot = &f.coordinator.registry().trunk_snapshots()[0];
    assert!(!snapshot.idle);
    assert_eq!(snapshot.active_stations, 1);

    f.mixer.kick_all();
    settle().await;
    assert_eq!(station_task.await.unwrap().unwrap(), DialStatus::Success);
    assert!(f.coordinator.registry().trunk_snapshots()[0].idle);
}

#[tokio::test(start_paused = true)]
async fn test_failed_outbound_dial_releases_trunk() {
    let f = start(two_station_config());
    let trunk = f.dial.expect_dial("SIP/line1");

    let coordinator = f.coordinator.clone();
    let leg = CallLeg::new("SIP/1001-leg");
    let station_task =
        tokio::spawn(async move { coordinator.station_off_hook("desk-a", leg, None).await });
    settle().await;

    trunk.push(DialState::Failed);
    settle().await;

    assert_eq!(station_task.await.unwrap().unwrap(), DialStatus::Failure);
    // Seizure reverted; the line can be taken again.
    assert!(f.coordinator.registry().trunk_snapshots()[0].idle);
    assert_eq!(
        f.notifier.last_for("desk-b_line1"),
        Some(DeviceState::NotInUse)
    );
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_off_hook_releases_trunk() {
    let f = start(two_station_config());
    // Planned but never progressed: the outbound dial stays outstanding.
    let _first = f.dial.expect_dial("SIP/line1");

    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
    let coordinator = f.coordinator.clone();
    let leg = CallLeg::new("SIP/1001-leg");
    let station_task = tokio::spawn(async move {
        tokio::select! {
            result = coordinator.station_off_hook("desk-a", leg, None) => Some(result),
            _ = cancel_rx => None,
        }
    });
    settle().await;
    assert_eq!(
        f.notifier.last_for("desk-b_line1"),
        Some(DeviceState::InUse)
    );

    // The caller's task goes away while the dial is still outstanding; no
    // worker outcome will ever arrive for this grant.
    cancel_tx.send(()).unwrap();
    assert!(station_task.await.unwrap().is_none());
    settle().await;

    // Seizure reverted.
    assert!(f.coordinator.registry().trunk_snapshots()[0].idle);
    assert_eq!(
        f.notifier.last_for("desk-b_line1"),
        Some(DeviceState::NotInUse)
    );

    // And the line can be taken again.
    let second = f.dial.expect_dial("SIP/line1");
    let coordinator = f.coordinator.clone();
    let leg_b = CallLeg::new("SIP/1002-leg");
    let task_b =
        tokio::spawn(async move { coordinator.station_off_hook("desk-b", leg_b, None).await });
    settle().await;
    second.answer();
    settle().await;
    assert_eq!(f.mixer.joined_in("line1"), 2);

    f.mixer.kick_all();
    settle().await;
    assert_eq!(task_b.await.unwrap().unwrap(), DialStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_off_hook_answers_ringing_trunk() {
    let f = start(two_station_config());
    let a = f.dial.expect_dial("SIP/1001");
    let b = f.dial.expect_dial("SIP/1002");

    let coordinator = f.coordinator.clone();
    let trunk_task = tokio::spawn(async move {
        coordinator
            .trunk_ringing("line1", CallLeg::new("SIP/line1-in"))
            .await
    });
    settle().await;
    assert_eq!(f.dial.dial_count("SIP/1002"), 1);

    // The user lifts the handset instead of the phone reporting an answer.
    let coordinator = f.coordinator.clone();
    let leg = CallLeg::new("SIP/1002-leg");
    let station_task =
        tokio::spawn(async move { coordinator.station_off_hook("desk-b", leg, None).await });
    settle().await;

    // Both outstanding ring attempts are moot once the episode resolves.
    assert!(a.was_cancelled());
    assert!(b.was_cancelled());
    assert_eq!(f.mixer.joined_in("line1"), 2);

    f.mixer.kick_all();
    settle().await;
    assert_eq!(trunk_task.await.unwrap().unwrap(), DialStatus::Success);
    assert_eq!(station_task.await.unwrap().unwrap(), DialStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_barge_into_active_call() {
    let f = start(two_station_config());
    let trunk = f.dial.expect_dial("SIP/line1");

    let coordinator = f.coordinator.clone();
    let leg_a = CallLeg::new("SIP/1001-leg");
    let task_a =
        tokio::spawn(async move { coordinator.station_off_hook("desk-a", leg_a, None).await });
    settle().await;
    trunk.answer();
    settle().await;
    assert_eq!(f.mixer.joined_in("line1"), 2);

    // Second station picks the same line and lands in the conference.
    let coordinator = f.coordinator.clone();
    let leg_b = CallLeg::new("SIP/1002-leg");
    let task_b = tokio::spawn(async move {
        coordinator
            .station_off_hook("desk-b", leg_b, Some("line1"))
            .await
    });
    settle().await;

    assert_eq!(f.mixer.joined_in("line1"), 3);
    assert_eq!(
        f.coordinator.registry().trunk_snapshots()[0].active_stations,
        2
    );

    f.mixer.kick_all();
    settle().await;
    assert_eq!(task_a.await.unwrap().unwrap(), DialStatus::Success);
    assert_eq!(task_b.await.unwrap().unwrap(), DialStatus::Success);
    assert!(f.coordinator.registry().trunk_snapshots()[0].idle);
}

#[tokio::test(start_paused = true)]
async fn test_barge_disabled_means_congestion() {
    let f = start(config(
        r#"
        [[trunks]]
        name = "line1"
        device = "SIP/line1"
        barge_disabled = true

        [[stations]]
        name = "desk-a"
        device = "SIP/1001"
        trunks = ["line1"]

        [[stations]]
        name = "desk-b"
        device = "SIP/1002"
        trunks = ["line1"]
        "#,
    ));
    let trunk = f.dial.expect_dial("SIP/line1");

    let coordinator = f.coordinator.clone();
    let leg_a = CallLeg::new("SIP/1001-leg");
    let task_a =
        tokio::spawn(async move { coordinator.station_off_hook("desk-a", leg_a, None).await });
    settle().await;
    trunk.answer();
    settle().await;

    // The only line is busy and cannot be barged.
    let status = f
        .coordinator
        .station_off_hook("desk-b", CallLeg::new("SIP/1002-leg"), None)
        .await
        .unwrap();
    assert_eq!(status, DialStatus::Congestion);

    f.mixer.kick_all();
    settle().await;
    assert_eq!(task_a.await.unwrap().unwrap(), DialStatus::Success);
}
