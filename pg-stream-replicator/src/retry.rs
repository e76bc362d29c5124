use std::time::Duration;

use pg_stream_config::shared::RetryConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential backoff with jitter between connection attempts.
///
/// Each delay is drawn from `[base / 2, base]`, where `base` starts at the initial delay, grows by
/// the multiplier after every attempt and is capped at the maximum delay.
#[derive(Debug)]
pub struct Backoff<R = StdRng> {
    rng: R,
    base: Duration,
    max_delay: Duration,
    multiplier: f64,
    remaining: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }
}

impl<R: Rng> Backoff<R> {
    pub fn with_rng(config: &RetryConfig, rng: R) -> Self {
        Self {
            rng,
            base: config.initial_delay().min(config.max_delay()),
            max_delay: config.max_delay(),
            multiplier: config.backoff_multiplier,
            // The first attempt is not preceded by a delay.
            remaining: config.max_attempts.saturating_sub(1),
        }
    }

    /// Delay before the next attempt, or `None` once all attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base = self.base;
        let half = base / 2;
        let jitter = self.rng.gen_range(0..=(base - half).as_millis() as u64);
        let delay = half + Duration::from_millis(jitter);

        self.base = base.mul_f64(self.multiplier).min(self.max_delay);

        Some(delay)
    }
}
