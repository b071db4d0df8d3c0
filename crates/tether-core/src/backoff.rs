//! Reconnect delay policy.
//!
//! Pure computation of retry delays from an attempt counter. Nothing here
//! touches a clock or a socket; the state machine feeds in the counter and a
//! jitter sample and gets back a delay plus the counter to store.
//!
//! # Example
//!
//! ```
//! use tether_core::backoff::ReconnectPolicy;
//!
//! let policy = ReconnectPolicy::new().with_jitter_max_ms(0);
//! let step = policy.step(3, 0);
//! assert_eq!(step.next_attempts, 4);
//! assert!(step.delay.as_millis() > 5_000);
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Why a session ended, as far as the reconnect policy is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectClass {
    /// Kick/error/end with no transfer pending. Exponential backoff.
    TransientTransportFailure,
    /// A deliberate server-side transfer. Short fixed delay, no penalty.
    ExpectedTransfer,
    /// The transport refused to even start. Fixed delay.
    SessionCreationFailure,
    /// Something panicked. Fixed delay after forced cleanup.
    UncaughtFault,
    /// The liveness monitor found a half-closed transport.
    DeadTransport,
}

impl DisconnectClass {
    /// Whether this class advances the exponential backoff counter.
    #[must_use]
    pub const fn counts_against_backoff(self) -> bool {
        matches!(self, Self::TransientTransportFailure)
    }
}

impl std::fmt::Display for DisconnectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientTransportFailure => write!(f, "transient_transport_failure"),
            Self::ExpectedTransfer => write!(f, "expected_transfer"),
            Self::SessionCreationFailure => write!(f, "session_creation_failure"),
            Self::UncaughtFault => write!(f, "uncaught_fault"),
            Self::DeadTransport => write!(f, "dead_transport"),
        }
    }
}

/// Result of one backoff computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStep {
    /// Delay before the next connect attempt, jitter included.
    pub delay: Duration,
    /// Attempt counter to store after this failure.
    pub next_attempts: u32,
    /// True when the periodic counter reset was applied.
    pub reset: bool,
}

/// A scheduled reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    /// How long to wait in `Backoff`.
    pub delay: Duration,
    /// Attempt counter after this disconnect.
    pub attempts: u32,
    /// The class that produced this plan.
    pub class: DisconnectClass,
}

/// Policy translating disconnects into reconnect delays.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Base delay for exponential backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub growth: f64,
    /// Maximum backoff delay before jitter (milliseconds).
    pub max_delay_ms: u64,
    /// Jitter is sampled uniformly from `[0, jitter_max_ms)`.
    pub jitter_max_ms: u64,
    /// Exponent ceiling; attempts beyond this do not grow the delay further.
    pub max_exponent: u32,
    /// When the counter reaches a multiple of this, it is reset to 1.
    pub reset_every: u32,
    /// Lower bound of the expected-transfer delay window (milliseconds).
    pub transfer_min_ms: u64,
    /// Exclusive upper bound of the expected-transfer delay window.
    pub transfer_max_ms: u64,
    /// Fixed delay after a session creation failure.
    pub creation_failure_ms: u64,
    /// Fixed delay after an uncaught fault.
    pub fault_recovery_ms: u64,
    /// Fixed delay after the monitor tears down a dead transport.
    pub dead_transport_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            growth: 1.1,
            max_delay_ms: 300_000,
            jitter_max_ms: 2_000,
            max_exponent: 20,
            reset_every: 100,
            transfer_min_ms: 5_000,
            transfer_max_ms: 8_000,
            creation_failure_ms: 10_000,
            fault_recovery_ms: 5_000,
            dead_transport_ms: 5_000,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set growth factor.
    #[must_use]
    pub const fn with_growth(mut self, growth: f64) -> Self {
        self.growth = growth;
        self
    }

    /// Builder: set delay cap.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Builder: set jitter range. Zero disables jitter.
    #[must_use]
    pub const fn with_jitter_max_ms(mut self, ms: u64) -> Self {
        self.jitter_max_ms = ms;
        self
    }

    /// Delay before jitter for a given attempt counter.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn base_delay_for(&self, attempts: u32) -> u64 {
        let exp = attempts.min(self.max_exponent) as i32;
        let raw = self.base_delay_ms as f64 * self.growth.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        capped as u64
    }

    /// Compute the delay for the current counter and the counter to store.
    ///
    /// The delay uses the counter as it stands *before* this failure; the
    /// returned counter is one higher. When the counter sits on a multiple of
    /// `reset_every`, it is reset first: the delay falls back to the plain
    /// base delay and the stored counter becomes 1.
    #[must_use]
    pub fn step(&self, attempts: u32, jitter_ms: u64) -> BackoffStep {
        let jitter = if self.jitter_max_ms == 0 {
            0
        } else {
            jitter_ms.min(self.jitter_max_ms - 1)
        };

        if self.reset_every != 0 && attempts != 0 && attempts % self.reset_every == 0 {
            return BackoffStep {
                delay: Duration::from_millis(self.base_delay_ms + jitter),
                next_attempts: 1,
                reset: true,
            };
        }

        BackoffStep {
            delay: Duration::from_millis(self.base_delay_for(attempts) + jitter),
            next_attempts: attempts.saturating_add(1),
            reset: false,
        }
    }

    /// Sample a jitter value in `[0, jitter_max_ms)`.
    pub fn sample_jitter<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        if self.jitter_max_ms == 0 {
            0
        } else {
            rng.gen_range(0..self.jitter_max_ms)
        }
    }

    /// Turn a disconnect into a concrete reconnect plan.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        class: DisconnectClass,
        attempts: u32,
        rng: &mut R,
    ) -> ReconnectPlan {
        let (delay, attempts) = match class {
            DisconnectClass::TransientTransportFailure => {
                let step = self.step(attempts, self.sample_jitter(rng));
                (step.delay, step.next_attempts)
            }
            DisconnectClass::ExpectedTransfer => {
                let ms = if self.transfer_max_ms > self.transfer_min_ms {
                    rng.gen_range(self.transfer_min_ms..self.transfer_max_ms)
                } else {
                    self.transfer_min_ms
                };
                (Duration::from_millis(ms), attempts)
            }
            DisconnectClass::SessionCreationFailure => {
                (Duration::from_millis(self.creation_failure_ms), attempts)
            }
            DisconnectClass::UncaughtFault => {
                (Duration::from_millis(self.fault_recovery_ms), attempts)
            }
            DisconnectClass::DeadTransport => {
                (Duration::from_millis(self.dead_transport_ms), attempts)
            }
        };

        ReconnectPlan {
            delay,
            attempts,
            class,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy::new().with_jitter_max_ms(0)
    }

    #[test]
    fn first_failure_uses_base_delay() {
        let step = no_jitter().step(0, 0);
        assert_eq!(step.delay, Duration::from_millis(5_000));
        assert_eq!(step.next_attempts, 1);
        assert!(!step.reset);
    }

    #[test]
    fn delay_uses_counter_before_increment() {
        let policy = ReconnectPolicy::new();
        let step = policy.step(3, 1_234);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let expected = (5_000.0_f64 * 1.1_f64.powi(3)) as u64 + 1_234;
        assert_eq!(step.delay, Duration::from_millis(expected));
        assert_eq!(step.next_attempts, 4);
    }

    #[test]
    fn jitter_is_clamped_below_max() {
        let step = ReconnectPolicy::new().step(0, 50_000);
        assert_eq!(step.delay, Duration::from_millis(5_000 + 1_999));
    }

    #[test]
    fn exponent_stops_growing_after_twenty() {
        let policy = no_jitter().with_max_delay_ms(u64::MAX);
        assert_eq!(policy.base_delay_for(20), policy.base_delay_for(57));
    }

    #[test]
    fn cap_bounds_the_delay() {
        let policy = no_jitter().with_growth(3.0);
        assert_eq!(policy.base_delay_for(20), 300_000);
    }

    #[test]
    fn multiple_of_reset_period_falls_back_to_base() {
        let policy = no_jitter();
        for attempts in [100, 200, 300] {
            let step = policy.step(attempts, 0);
            assert_eq!(step.delay, Duration::from_millis(5_000));
            assert_eq!(step.next_attempts, 1);
            assert!(step.reset);
        }
        assert!(!policy.step(99, 0).reset);
    }

    #[test]
    fn expected_transfer_does_not_touch_counter() {
        let mut rng = StdRng::seed_from_u64(7);
        let policy = ReconnectPolicy::new();
        for _ in 0..64 {
            let plan = policy.plan(DisconnectClass::ExpectedTransfer, 9, &mut rng);
            assert_eq!(plan.attempts, 9);
            assert!(plan.delay >= Duration::from_millis(5_000));
            assert!(plan.delay < Duration::from_millis(8_000));
        }
    }

    #[test]
    fn creation_failure_is_fixed() {
        let mut rng = StdRng::seed_from_u64(1);
        let plan = ReconnectPolicy::new().plan(DisconnectClass::SessionCreationFailure, 4, &mut rng);
        assert_eq!(plan.delay, Duration::from_secs(10));
        assert_eq!(plan.attempts, 4);
    }

    #[test]
    fn only_transient_failures_count() {
        assert!(DisconnectClass::TransientTransportFailure.counts_against_backoff());
        assert!(!DisconnectClass::ExpectedTransfer.counts_against_backoff());
        assert!(!DisconnectClass::UncaughtFault.counts_against_backoff());
    }

    proptest! {
        #[test]
        fn delay_is_non_decreasing_and_capped(a in 1u32..20) {
            let policy = no_jitter();
            let lo = policy.step(a, 0).delay;
            let hi = policy.step(a + 1, 0).delay;
            prop_assert!(lo <= hi);
            prop_assert!(hi <= Duration::from_millis(300_000));
        }

        #[test]
        fn jittered_delay_stays_within_range(a in 0u32..1_000, seed in any::<u64>()) {
            let policy = ReconnectPolicy::new();
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = policy.plan(DisconnectClass::TransientTransportFailure, a, &mut rng);
            prop_assert!(plan.delay >= Duration::from_millis(5_000));
            prop_assert!(plan.delay < Duration::from_millis(302_000));
        }
    }
}
