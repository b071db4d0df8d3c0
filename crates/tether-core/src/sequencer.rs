//! Interaction sequencer.
//!
//! Runs a scripted open-scan-click-close exchange against a server-side
//! window to trigger a deliberate transfer:
//!
//! 1. select the configured hotbar slot (emerald only)
//! 2. arm a one-shot `WindowOpened` handler
//! 3. trigger the window (use the held item, or send the accept command)
//! 4. once the window opens and its slots settle, look for a marker item
//! 5. arm [`ExpectedDisconnect`], click the marker, then close the window
//!
//! A missing window or marker is logged and ends the sequence. Nothing here
//! returns an error or panics into the caller; every path ends in a
//! [`SequenceOutcome`].
//!
//! Sequences run as session-owned tasks, so cleanup aborts them together
//! with the session they were started for.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SequencerConfig;
use crate::session::EventSurface;
use crate::transport::{EventKind, GameConnection, MouseButton, TransportEvent, Window};

// ─────────────────────────────────────────────────────────────────────────────
// Expected disconnect flag
// ─────────────────────────────────────────────────────────────────────────────

/// Marks the next disconnect as a deliberate transfer.
///
/// Armed right before a click that should move us to another server;
/// consumed by exactly one terminal-event handling.
#[derive(Debug, Clone, Default)]
pub struct ExpectedDisconnect(Arc<AtomicBool>);

impl ExpectedDisconnect {
    /// Create an unarmed flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the flag.
    pub fn arm(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Read and clear. Returns whether the flag was armed.
    pub fn consume(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    /// Clear without consuming a disconnect.
    pub fn retire(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether the flag is armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sequence kinds and outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Which scripted exchange to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    /// Use the held item and click the emerald.
    Emerald,
    /// Send the accept command and click the lime pane.
    Accept,
}

impl SequenceKind {
    /// Case-sensitive substrings identifying the marker item.
    #[must_use]
    pub const fn markers(self) -> &'static [&'static str] {
        match self {
            Self::Emerald => &["emerald", "Emerald"],
            Self::Accept => &["lime", "Lime", "lime_stained_glass", "Lime Stained Glass"],
        }
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emerald => write!(f, "emerald"),
            Self::Accept => write!(f, "accept"),
        }
    }
}

impl FromStr for SequenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emerald" => Ok(Self::Emerald),
            "accept" => Ok(Self::Accept),
            other => Err(format!("unknown sequence kind: {other}")),
        }
    }
}

/// How a sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// The marker was clicked; a transfer is expected.
    Clicked {
        /// Window the marker was in.
        window_id: u32,
        /// Slot index that was clicked.
        slot: usize,
    },
    /// The window opened but held no marker.
    MarkerNotFound {
        /// Window that was scanned.
        window_id: u32,
    },
    /// No window opened before the deadline.
    WindowTimedOut,
    /// A transport action failed or the sequence panicked.
    Failed(String),
}

impl SequenceOutcome {
    /// Whether the marker was clicked.
    #[must_use]
    pub const fn is_clicked(&self) -> bool {
        matches!(self, Self::Clicked { .. })
    }
}

/// Find the first slot whose item name or display name contains a marker.
#[must_use]
pub fn find_marker(window: &Window, markers: &[&str]) -> Option<usize> {
    window.slots.iter().position(|slot| {
        slot.as_ref().is_some_and(|item| {
            markers
                .iter()
                .any(|m| item.name.contains(m) || item.display_name.contains(m))
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// One-shot window handler state
// ─────────────────────────────────────────────────────────────────────────────

/// State of a one-shot window handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionState {
    /// Waiting for a window.
    Armed,
    /// A window arrived first.
    Fired,
    /// The deadline passed first.
    TimedOut,
}

/// Shared between the event path and the timeout path; whichever moves it
/// out of `Armed` first wins and the other becomes a no-op.
#[derive(Debug)]
pub struct PendingInteraction {
    state: Mutex<InteractionState>,
}

impl Default for PendingInteraction {
    fn default() -> Self {
        Self {
            state: Mutex::new(InteractionState::Armed),
        }
    }
}

impl PendingInteraction {
    /// Create an armed interaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&self, to: InteractionState) -> bool {
        let mut state = self.state.lock();
        if *state == InteractionState::Armed {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Event path. Returns `false` if the timeout already won.
    pub fn fire(&self) -> bool {
        self.transition(InteractionState::Fired)
    }

    /// Timeout path. Returns `false` if the event already won.
    pub fn time_out(&self) -> bool {
        self.transition(InteractionState::TimedOut)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> InteractionState {
        *self.state.lock()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sequencer
// ─────────────────────────────────────────────────────────────────────────────

/// Runs interaction sequences against a live connection.
#[derive(Debug, Clone)]
pub struct Sequencer {
    config: SequencerConfig,
    expected: ExpectedDisconnect,
}

impl Sequencer {
    /// Create a sequencer that arms `expected` before clicking.
    #[must_use]
    pub const fn new(config: SequencerConfig, expected: ExpectedDisconnect) -> Self {
        Self { config, expected }
    }

    /// Run one sequence to completion.
    ///
    /// Never panics and never returns an error; failures are logged and
    /// reported as [`SequenceOutcome::Failed`].
    #[instrument(skip_all, fields(kind = %kind))]
    pub async fn run(
        &self,
        kind: SequenceKind,
        conn: Arc<dyn GameConnection>,
        surface: &EventSurface,
    ) -> SequenceOutcome {
        match AssertUnwindSafe(self.run_inner(kind, conn.as_ref(), surface))
            .catch_unwind()
            .await
        {
            Ok(outcome) => {
                debug!(?outcome, "Sequence finished");
                outcome
            }
            Err(_) => {
                error!("Sequence panicked");
                SequenceOutcome::Failed("sequence panicked".into())
            }
        }
    }

    async fn run_inner(
        &self,
        kind: SequenceKind,
        conn: &dyn GameConnection,
        surface: &EventSurface,
    ) -> SequenceOutcome {
        if kind == SequenceKind::Emerald {
            if let Err(e) = conn.select_hotbar_slot(self.config.hotbar_slot).await {
                warn!(error = %e, "Failed to select hotbar slot");
                return SequenceOutcome::Failed(e.to_string());
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.window_timeout_ms);
        let pending = Arc::new(PendingInteraction::new());
        let (tx, mut rx) = oneshot::channel::<Window>();
        let handler_state = Arc::clone(&pending);
        let subscription = surface.subscribe_once(EventKind::WindowOpened, move |event| {
            if handler_state.fire() {
                if let TransportEvent::WindowOpened(window) = event {
                    let _ = tx.send(window.clone());
                }
            }
        });

        let triggered = match kind {
            SequenceKind::Emerald => {
                tokio::time::sleep(Duration::from_millis(self.config.activate_delay_ms)).await;
                conn.activate_held_item().await
            }
            SequenceKind::Accept => conn.chat(&self.config.accept_command).await,
        };
        if let Err(e) = triggered {
            subscription.unsubscribe();
            pending.time_out();
            warn!(error = %e, "Failed to trigger window");
            return SequenceOutcome::Failed(e.to_string());
        }

        let window = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(window)) => window,
            Ok(Err(_)) => {
                subscription.unsubscribe();
                return SequenceOutcome::Failed("window handler dropped".into());
            }
            Err(_) => {
                subscription.unsubscribe();
                if pending.time_out() {
                    warn!(
                        timeout_ms = self.config.window_timeout_ms,
                        "No window opened in time"
                    );
                    return SequenceOutcome::WindowTimedOut;
                }
                // The window landed between the deadline and here.
                match rx.try_recv() {
                    Ok(window) => window,
                    Err(_) => return SequenceOutcome::WindowTimedOut,
                }
            }
        };
        subscription.unsubscribe();

        info!(window_id = window.id, slots = window.slots.len(), "Window opened");
        tokio::time::sleep(Duration::from_millis(self.config.slot_settle_ms)).await;

        let Some(slot) = find_marker(&window, kind.markers()) else {
            warn!(window_id = window.id, "No marker item in window");
            return SequenceOutcome::MarkerNotFound {
                window_id: window.id,
            };
        };

        self.expected.arm();
        info!(window_id = window.id, slot, "Clicking marker, transfer expected");
        if let Err(e) = conn.click_window_slot(slot, MouseButton::Primary).await {
            warn!(error = %e, slot, "Marker click failed");
            return SequenceOutcome::Failed(e.to_string());
        }

        tokio::time::sleep(Duration::from_millis(self.config.close_delay_ms)).await;
        if conn.current_window().is_some() {
            if let Err(e) = conn.close_window().await {
                debug!(error = %e, "Close window failed");
            }
        }

        SequenceOutcome::Clicked {
            window_id: window.id,
            slot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Item;

    fn window(slots: Vec<Option<Item>>) -> Window {
        Window {
            id: 3,
            kind: "generic_9x3".into(),
            title: None,
            slots,
        }
    }

    #[test]
    fn marker_matches_substring_of_name() {
        let w = window(vec![
            None,
            Some(Item::new("stone", "Stone")),
            Some(Item::new("emerald_block", "Block of Emerald")),
        ]);
        assert_eq!(find_marker(&w, SequenceKind::Emerald.markers()), Some(2));
    }

    #[test]
    fn marker_matches_display_name() {
        let w = window(vec![Some(Item::new("stained_glass_pane", "Lime Stained Glass"))]);
        assert_eq!(find_marker(&w, SequenceKind::Accept.markers()), Some(0));
    }

    #[test]
    fn marker_match_is_case_sensitive() {
        let w = window(vec![Some(Item::new("EMERALD", "EMERALD"))]);
        assert_eq!(find_marker(&w, SequenceKind::Emerald.markers()), None);
    }

    #[test]
    fn first_marker_wins() {
        let w = window(vec![
            Some(Item::new("lime_dye", "")),
            Some(Item::new("lime_stained_glass", "")),
        ]);
        assert_eq!(find_marker(&w, SequenceKind::Accept.markers()), Some(0));
    }

    #[test]
    fn pending_interaction_first_transition_wins() {
        let p = PendingInteraction::new();
        assert!(p.fire());
        assert!(!p.time_out());
        assert_eq!(p.state(), InteractionState::Fired);

        let p = PendingInteraction::new();
        assert!(p.time_out());
        assert!(!p.fire());
        assert_eq!(p.state(), InteractionState::TimedOut);
    }

    #[test]
    fn expected_flag_is_consumed_once() {
        let flag = ExpectedDisconnect::new();
        flag.arm();
        let shared = flag.clone();
        assert!(shared.consume());
        assert!(!flag.consume());
        assert!(!flag.is_armed());
    }

    #[test]
    fn kind_round_trips_through_str() {
        assert_eq!("accept".parse::<SequenceKind>(), Ok(SequenceKind::Accept));
        assert_eq!(SequenceKind::Emerald.to_string(), "emerald");
        assert!("nether".parse::<SequenceKind>().is_err());
    }
}
