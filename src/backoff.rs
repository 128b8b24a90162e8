//! Retry timing: an injectable clock and an exponential backoff state machine.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

// ============================================================================
// Clock
// ============================================================================

/// Time source used by the retry loops. Tests inject a fake that records
/// sleeps instead of performing them.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;

    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff with jitter.
///
/// Delay for attempt `n` (1-based) is `base * 2^(n-1)`, capped at `max`, then
/// jittered uniformly into `[delay/2, delay]`.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            attempt: 0,
            base,
            max: max.max(base),
            rng,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Un-jittered delay for the given 1-based attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let raw = self.base.as_millis().saturating_mul(1u128 << shift);
        Duration::from_millis(raw.min(self.max.as_millis()) as u64)
    }

    /// Advances the state machine and returns the next delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let ceiling = self.ceiling(self.attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let floor = ceiling / 2;
        Duration::from_millis(self.rng.random_range(floor..=ceiling))
    }
}
