//! Liveness monitor.
//!
//! Every period the monitor asks the state machine to compare what it
//! believes about the connection with what the transport reports. The
//! decision itself is the pure function [`assess`]; the machine gathers a
//! [`LivenessSnapshot`] and acts on the [`LivenessVerdict`].

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::machine::{ConnectionState, MachineEvent};

/// What the machine looked like when the check ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Whether a manual stop is in effect.
    pub manual_stop: bool,
    /// Whether a session exists.
    pub has_session: bool,
    /// Whether the session's background tasks have started.
    pub tasks_initialized: bool,
    /// The transport's own liveness indicator, if a connection exists.
    pub transport_open: Option<bool>,
    /// Current attempt counter.
    pub attempts: u32,
    /// Time since the last successful spawn.
    pub since_last_spawn: Option<Duration>,
}

/// Why a check did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Manual stop is in effect.
    ManualStop,
    /// The machine is connecting, cleaning up, or waiting to reconnect.
    Transitioning,
    /// A spawn happened too recently.
    GraceWindow,
}

/// Outcome of one liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum LivenessVerdict {
    /// Nothing was inspected.
    Skipped(SkipReason),
    /// Belief matches reality.
    Healthy,
    /// Online with tasks running, but the transport is closed.
    DeadTransport,
    /// Idle with no session and no failures: the initial connect was missed.
    MissedConnect,
}

/// Decide what a liveness check should do.
#[must_use]
pub fn assess(snapshot: &LivenessSnapshot, grace: Duration) -> LivenessVerdict {
    if snapshot.manual_stop {
        return LivenessVerdict::Skipped(SkipReason::ManualStop);
    }
    if matches!(
        snapshot.state,
        ConnectionState::Connecting | ConnectionState::CleaningUp | ConnectionState::Backoff
    ) {
        return LivenessVerdict::Skipped(SkipReason::Transitioning);
    }
    if snapshot.since_last_spawn.is_some_and(|d| d < grace) {
        return LivenessVerdict::Skipped(SkipReason::GraceWindow);
    }

    if snapshot.state == ConnectionState::Online
        && snapshot.tasks_initialized
        && snapshot.transport_open == Some(false)
    {
        return LivenessVerdict::DeadTransport;
    }

    if !snapshot.has_session && snapshot.state == ConnectionState::Idle && snapshot.attempts == 0 {
        return LivenessVerdict::MissedConnect;
    }

    LivenessVerdict::Healthy
}

/// Post a liveness tick into the machine's mailbox every `period`.
///
/// The first tick fires one full period after start. The task ends once
/// the mailbox is closed.
pub(crate) fn spawn_ticker(
    period: Duration,
    mailbox: mpsc::UnboundedSender<MachineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if mailbox.send(MachineEvent::LivenessTick { reply: None }).is_err() {
                debug!("Liveness monitor stopped");
                break;
            }
        }
    })
}
