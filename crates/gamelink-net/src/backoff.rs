//! Exponential reconnect backoff with jitter.
//!
//! [`Backoff`] hands out delays that start at the minimum reconnect interval
//! and double up to the maximum. Jitter never pushes a delay outside that
//! range. Giving up is the connection manager's call, not this type's.

use std::time::Duration;

use rand::Rng;

/// Shape of the reconnect delay curve.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay, and the floor for every delay. Default: 500 ms.
    pub min_delay: Duration,
    /// Ceiling for every delay. Default: 5 s.
    pub max_delay: Duration,
    /// Multiplier applied after each delay. Default: 2.0.
    pub multiplier: f64,
    /// Jitter factor (0.0–1.0), applied as ±jitter. Default: 0.25.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Tracks the current step of the backoff curve.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    steps: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.min_delay;
        Self {
            config,
            steps: 0,
            current,
        }
    }

    /// Compute the next delay and advance the curve.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.steps += 1;

        let jittered = if self.config.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        self.current = self
            .current
            .mul_f64(self.config.multiplier)
            .min(self.config.max_delay);

        jittered.min(self.config.max_delay).max(self.config.min_delay)
    }

    /// Back to the first step (after a connection proved healthy).
    pub fn reset(&mut self) {
        self.steps = 0;
        self.current = self.config.min_delay;
    }

    /// Delays handed out since the last reset.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}
