//! Background tasks started once a session is fully initialized.
//!
//! Both run as session-owned tasks and die with the session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::transport::GameConnection;

/// Probability that a sneak turn actually taps sneak.
const SNEAK_CHANCE: f64 = 0.1;
const SNEAK_HOLD: Duration = Duration::from_millis(50);
const YAW_JITTER: f32 = 0.01;
const PITCH_JITTER: f32 = 0.005;

/// One anti-idle decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AntiIdleAction {
    /// Nudge the view.
    Look {
        /// Yaw delta (radians).
        yaw: f32,
        /// Pitch delta (radians).
        pitch: f32,
    },
    /// Tap sneak briefly.
    SneakTap,
}

/// Keeps the session from being flagged idle.
///
/// Each period, with `probability`, takes the next turn in a look/sneak
/// rotation.
#[derive(Debug)]
pub struct AntiIdle {
    interval: Duration,
    probability: f64,
    turn: usize,
    rng: StdRng,
}

impl AntiIdle {
    /// Create an anti-idle loop.
    #[must_use]
    pub fn new(interval: Duration, probability: f64, rng: StdRng) -> Self {
        Self {
            interval,
            probability: probability.clamp(0.0, 1.0),
            turn: 0,
            rng,
        }
    }

    /// Decide what this period does. `None` means skip.
    pub fn next_action(&mut self) -> Option<AntiIdleAction> {
        if !self.rng.gen_bool(self.probability) {
            return None;
        }
        let turn = self.turn;
        self.turn += 1;
        if turn % 2 == 0 {
            Some(AntiIdleAction::Look {
                yaw: self.rng.gen_range(-YAW_JITTER..YAW_JITTER),
                pitch: self.rng.gen_range(-PITCH_JITTER..PITCH_JITTER),
            })
        } else if self.rng.gen_bool(SNEAK_CHANCE) {
            Some(AntiIdleAction::SneakTap)
        } else {
            None
        }
    }

    /// Run until aborted.
    pub async fn run(mut self, conn: Arc<dyn GameConnection>) {
        info!(interval_secs = self.interval.as_secs(), "Anti-idle started");
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let result = match self.next_action() {
                None => continue,
                Some(AntiIdleAction::Look { yaw, pitch }) => conn.look_by(yaw, pitch).await,
                Some(AntiIdleAction::SneakTap) => match conn.set_sneak(true).await {
                    Ok(()) => {
                        tokio::time::sleep(SNEAK_HOLD).await;
                        conn.set_sneak(false).await
                    }
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = result {
                debug!(error = %e, "Anti-idle action failed");
            }
        }
    }
}

/// Periodically persist the transport's latest view frame.
pub async fn run_capture(conn: Arc<dyn GameConnection>, interval: Duration, path: PathBuf) {
    info!(path = %path.display(), "View capture started");
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match conn.capture_view().await {
            Ok(Some(frame)) => {
                if let Err(e) = tokio::fs::write(&path, &frame).await {
                    warn!(error = %e, path = %path.display(), "Failed to write capture");
                } else {
                    debug!(bytes = frame.len(), "Captured view");
                }
            }
            Ok(None) => debug!("No view frame available"),
            Err(e) => debug!(error = %e, "View capture failed"),
        }
    }
}
