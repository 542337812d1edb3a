//! Exponential backoff state machine used by the session worker.

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

use super::config::BackoffPolicy;

/// Tracks reconnection attempts and produces jittered delays.
#[derive(Debug)]
pub struct BackoffState {
    policy: BackoffPolicy,
    attempts: u32,
    rng: StdRng,
}

impl BackoffState {
    /// Create a new state machine from the supplied policy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self {
            policy,
            attempts: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Retries consumed since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Un-jittered delay after attempt `k`: `min(cap, base * 2^k)`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        self.policy
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.policy.cap)
    }

    /// Consume one retry and return how long to wait before it, or `None`
    /// once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let nominal = self.nominal_delay(self.attempts);
        self.attempts += 1;
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Some(nominal);
        }
        let factor = self.rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        Some(nominal.mul_f64(factor))
    }

    /// Reset the attempt budget after a successful connection.
    pub fn record_success(&mut self) {
        self.attempts = 0;
    }
}
