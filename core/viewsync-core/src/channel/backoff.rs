use rand::Rng;
use std::cmp;
use std::time::Duration;

use crate::config::ChannelConfig;

// Doubling stops growing after this many attempts; the cap takes over long before.
const MAX_DOUBLINGS: u32 = 16;

/// Bounded exponential reconnect delay with optional jitter.
///
/// Attempts are unlimited; only the delay is bounded.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: cmp::max(base, max),
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 },
            attempts: 0,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
            config.reconnect_jitter,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = compute_delay(self.base, self.max, self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        apply_jitter(delay, self.max, self.jitter, &mut rand::thread_rng())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

fn compute_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << cmp::min(attempt, MAX_DOUBLINGS);
    cmp::min(base.saturating_mul(factor), max)
}

fn apply_jitter<R: Rng>(delay: Duration, max: Duration, jitter: f64, rng: &mut R) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
    cmp::min(delay.mul_f64(factor), max)
}
