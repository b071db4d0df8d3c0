//! Interaction sequences driven directly against a mock connection.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tether_core::config::SequencerConfig;
use tether_core::{
    ExpectedDisconnect, GameConnection, MouseButton, SequenceKind, SequenceOutcome, Sequencer,
};
use tether_testkit::{Behavior, Call, standalone_connection, window_with};

fn sequencer(flag: &ExpectedDisconnect) -> Sequencer {
    Sequencer::new(SequencerConfig::default(), flag.clone())
}

#[tokio::test(start_paused = true)]
async fn emerald_arms_the_flag_before_clicking() {
    let flag = ExpectedDisconnect::new();
    let observed = flag.clone();
    let (conn, remote, log) = standalone_connection(
        Behavior::default()
            .opens_on_activate(window_with(3, "emerald", "Emerald"))
            .observe_click(move || observed.is_armed()),
    );
    let conn: Arc<dyn GameConnection> = conn;

    let outcome = sequencer(&flag)
        .run(SequenceKind::Emerald, conn, remote.surface())
        .await;

    assert_eq!(
        outcome,
        SequenceOutcome::Clicked {
            window_id: 3,
            slot: 1
        }
    );
    assert_eq!(
        log.calls(),
        vec![
            Call::SelectSlot(4),
            Call::ActivateItem,
            Call::Click {
                slot: 1,
                button: MouseButton::Primary,
                observed: true
            },
            Call::CloseWindow,
        ]
    );
    assert!(flag.is_armed());
    assert_eq!(remote.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn accept_sends_the_command_and_skips_the_hotbar() {
    let flag = ExpectedDisconnect::new();
    let (conn, remote, log) = standalone_connection(
        Behavior::default().opens_on_command(window_with(5, "lime_stained_glass_pane", "Confirm")),
    );
    let conn: Arc<dyn GameConnection> = conn;

    let outcome = sequencer(&flag)
        .run(SequenceKind::Accept, conn, remote.surface())
        .await;

    assert!(outcome.is_clicked());
    let calls = log.calls();
    assert_eq!(calls[0], Call::Chat("/tpaaccept".into()));
    assert!(!calls.iter().any(|c| matches!(c, Call::SelectSlot(_))));
    assert!(flag.is_armed());
}

#[tokio::test(start_paused = true)]
async fn missing_window_times_out_without_arming() {
    let flag = ExpectedDisconnect::new();
    let (conn, remote, log) = standalone_connection(Behavior::default());
    let conn: Arc<dyn GameConnection> = conn;

    let started = tokio::time::Instant::now();
    let outcome = sequencer(&flag)
        .run(SequenceKind::Emerald, conn, remote.surface())
        .await;

    assert_eq!(outcome, SequenceOutcome::WindowTimedOut);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(!flag.is_armed());
    assert_eq!(remote.listener_count(), 0);
    assert!(!log.calls().iter().any(|c| matches!(c, Call::Click { .. })));
}

#[tokio::test(start_paused = true)]
async fn window_without_marker_is_left_alone() {
    let flag = ExpectedDisconnect::new();
    let (conn, remote, log) =
        standalone_connection(Behavior::default().opens_on_activate(window_with(4, "stone", "Stone")));
    let conn: Arc<dyn GameConnection> = conn;

    let outcome = sequencer(&flag)
        .run(SequenceKind::Emerald, conn, remote.surface())
        .await;

    assert_eq!(outcome, SequenceOutcome::MarkerNotFound { window_id: 4 });
    assert!(!flag.is_armed());
    assert_eq!(log.count(|c| matches!(c, Call::Click { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn closed_connection_fails_cleanly() {
    let flag = ExpectedDisconnect::new();
    let (conn, remote, _log) = standalone_connection(Behavior::default());
    remote.half_close();
    let conn: Arc<dyn GameConnection> = conn;

    let outcome = sequencer(&flag)
        .run(SequenceKind::Accept, conn, remote.surface())
        .await;

    assert!(matches!(outcome, SequenceOutcome::Failed(_)));
    assert_eq!(remote.listener_count(), 0);
}
