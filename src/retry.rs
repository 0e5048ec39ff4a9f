//! Retry policy: a pure decision function over delivery outcomes.
//!
//! Exponential backoff keeps a struggling remote from being hammered, the
//! jitter term desynchronises agent fleets, and 4xx (other than 429) is
//! never retried.

use crate::config::AgentConfig;
use crate::transport::SendOutcome;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up on this endpoint.
    Stop,
    /// Wait, then retry the same endpoint.
    RetryAfter(Duration),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Self {
        Self { max_retries, base_delay, max_delay, jitter_factor }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_retry_delay,
            config.max_retry_delay,
            config.jitter_factor,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide what to do after `attempt` (0-based) produced `outcome`.
    pub fn decide(&self, attempt: u32, outcome: &SendOutcome) -> RetryDecision {
        self.decide_with_rng(attempt, outcome, &mut rand::rng())
    }

    /// Same as [`decide`](Self::decide) with a caller-supplied RNG, so the
    /// jitter term is reproducible in tests.
    pub fn decide_with_rng<R: Rng>(
        &self,
        attempt: u32,
        outcome: &SendOutcome,
        rng: &mut R,
    ) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::Stop;
        }
        match outcome {
            SendOutcome::Success { .. } | SendOutcome::ClientError { .. } => RetryDecision::Stop,
            SendOutcome::RateLimited { retry_after } => {
                let mut delay = self.backoff(attempt, rng);
                if let Some(server_delay) = retry_after {
                    delay = delay.max(*server_delay);
                }
                RetryDecision::RetryAfter(delay)
            }
            SendOutcome::ServerError { .. }
            | SendOutcome::ConnectionError { .. }
            | SendOutcome::DnsError { .. }
            | SendOutcome::Timeout => RetryDecision::RetryAfter(self.backoff(attempt, rng)),
        }
    }

    /// `min(max_delay, base * 2^attempt + U[0, base * 2^attempt * jitter])`.
    fn backoff<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        let exponential = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let jitter_span = exponential.mul_f64(self.jitter_factor);
        let jitter = jitter_span.mul_f64(rng.random::<f64>());
        (exponential + jitter).min(self.max_delay)
    }
}
