//! Session teardown.
//!
//! [`cleanup`] takes the current session out of its slot and tears it down
//! step by step. Every step is best-effort: a panicking connection
//! implementation is caught and logged, and the next step still runs. By the
//! time it returns, the slot is empty and a replacement may be created.

use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionId};

/// Quit reason sent to the remote on teardown.
pub const QUIT_REASON: &str = "disconnect.quitting";

/// What one teardown did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Session that was torn down.
    pub session: SessionId,
    /// Timers and background tasks that were still running.
    pub timers_cancelled: usize,
    /// Listeners removed from the event surface.
    pub listeners_removed: usize,
    /// Whether the socket was still open and had to be destroyed.
    pub transport_destroyed: bool,
    /// Whether the graceful quit was accepted.
    pub quit_sent: bool,
    /// Listeners left on the surface afterwards. Zero unless a step failed.
    pub listeners_remaining: usize,
    /// Timers left afterwards. Zero unless a step failed.
    pub timers_remaining: usize,
    /// True when the session had already been torn down.
    pub already_clean: bool,
}

impl CleanupReport {
    /// Whether nothing scoped to the session survived.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.listeners_remaining == 0 && self.timers_remaining == 0
    }
}

fn best_effort<T>(step: &'static str, session: SessionId, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(session = %session, step, "Cleanup step panicked");
            None
        }
    }
}

/// Tear down one session in place.
///
/// Safe to call any number of times; later calls report `already_clean`
/// and change nothing.
pub fn teardown(session: &mut Session) -> CleanupReport {
    let id = session.id;
    if session.destroyed {
        return CleanupReport {
            session: id,
            timers_cancelled: 0,
            listeners_removed: 0,
            transport_destroyed: false,
            quit_sent: false,
            listeners_remaining: session.listener_count(),
            timers_remaining: session.timer_count(),
            already_clean: true,
        };
    }

    let timers_cancelled = best_effort("cancel_timers", id, || {
        session.background.cancel_all() + session.timers.cancel_all()
    })
    .unwrap_or(0);
    debug!(session = %id, timers_cancelled, "Cancelled session timers");

    session.tasks_initialized = false;
    session.ready = false;

    let before = session.surface.listener_count();
    best_effort("unsubscribe", id, || {
        for sub in session.subscriptions.drain(..) {
            sub.unsubscribe();
        }
    });
    // In-flight sequences hold their own one-shot listeners.
    let stray = best_effort("clear_surface", id, || session.surface.clear()).unwrap_or(0);
    if stray > 0 {
        debug!(session = %id, stray, "Dropped untracked listeners");
    }
    let listeners_removed = before.saturating_sub(session.surface.listener_count());
    debug!(session = %id, listeners_removed, "Removed session listeners");

    let mut transport_destroyed = false;
    let mut quit_sent = false;
    if let Some(conn) = session.connection.take() {
        transport_destroyed = best_effort("destroy", id, || {
            if conn.is_open() {
                conn.destroy();
                true
            } else {
                false
            }
        })
        .unwrap_or(false);

        quit_sent = match best_effort("quit", id, || conn.quit(QUIT_REASON)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                debug!(session = %id, error = %e, "Quit after close ignored");
                false
            }
            None => false,
        };
    }

    session.destroyed = true;

    let report = CleanupReport {
        session: id,
        timers_cancelled,
        listeners_removed,
        transport_destroyed,
        quit_sent,
        listeners_remaining: session.surface.listener_count(),
        timers_remaining: session.timer_count(),
        already_clean: false,
    };
    info!(
        session = %id,
        timers = report.timers_cancelled,
        listeners = report.listeners_removed,
        destroyed = report.transport_destroyed,
        age_ms = u64::try_from(session.age().as_millis()).unwrap_or(u64::MAX),
        "Session cleaned up"
    );
    report
}

/// Tear down whatever session occupies `slot` and clear it.
///
/// Returns `None` when the slot was already empty.
pub fn cleanup(slot: &mut Option<Session>) -> Option<CleanupReport> {
    let mut session = slot.take()?;
    Some(teardown(&mut session))
}
