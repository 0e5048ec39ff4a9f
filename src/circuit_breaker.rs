//! Circuit breaker guarding the HTTP transport.
//!
//! Three states. `Closed` counts consecutive delivery failures and opens
//! once the streak reaches the threshold *and* contains at least one
//! connection-class or DNS failure: a remote that answers (even with 5xx)
//! is reachable, so pure server-error streaks keep probing. DNS failures
//! carry their own streak: enough of them force the circuit open even when
//! other outcomes are interleaved. `Open` rejects everything until the
//! cooldown deadline, then a single `HalfOpen` probe decides between
//! closing and another full cooldown.
//!
//! The breaker is owned by the forwarder task and never shared, so it is a
//! plain state machine with `&mut self` transitions; the forwarder mirrors
//! its state into shared stats for observability.

use crate::clock::Clock;
use crate::transport::SendOutcome;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,

    state: CircuitState,
    /// Monotonic-millis deadline while `Open`.
    open_until: Option<u64>,
    consecutive_failures: u32,
    /// Whether the current failure streak contains a connection-class or
    /// DNS failure.
    streak_unreachable: bool,
    dns_failures: u32,
    last_success: Option<SystemTime>,
    opens: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold,
            cooldown,
            clock,
            state: CircuitState::Closed,
            open_until: None,
            consecutive_failures: 0,
            streak_unreachable: false,
            dns_failures: 0,
            last_success: None,
            opens: 0,
        }
    }

    /// Advance `Open` to `HalfOpen` once the cooldown has elapsed, and
    /// return the current state.
    pub fn poll(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            let expired = self.open_until.map_or(true, |until| self.clock.now_mono() >= until);
            if expired {
                info!("circuit breaker cooled down, probing (half-open)");
                self.state = CircuitState::HalfOpen;
                self.open_until = None;
                self.consecutive_failures = 0;
                self.streak_unreachable = false;
            }
        }
        self.state
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Disk recovery is pointless while the remote is known-bad: it would
    /// stage fresh data for inevitable failure.
    pub fn allows_recovery(&self) -> bool {
        self.state != CircuitState::Open
    }

    pub fn record_outcome(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Success { .. } => self.record_success(),
            SendOutcome::DnsError { .. } => {
                self.dns_failures += 1;
                self.record_failure(true);
            }
            other if other.counts_toward_breaker() => {
                self.record_failure(other.is_connection_class());
            }
            // 429 and client errors say the remote is alive and reachable.
            _ => {}
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.dns_failures = 0;
        self.streak_unreachable = false;
        self.last_success = Some(self.clock.now_wall());
        if self.state != CircuitState::Closed {
            info!("circuit breaker closed after successful delivery");
            self.state = CircuitState::Closed;
            self.open_until = None;
        }
    }

    /// Open immediately, outside the normal streak accounting (startup DNS
    /// probe failures use this).
    pub fn force_open(&mut self, reason: &str) {
        self.open(reason);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn dns_failures(&self) -> u32 {
        self.dns_failures
    }

    pub fn opens(&self) -> u64 {
        self.opens
    }

    pub fn last_success(&self) -> Option<SystemTime> {
        self.last_success
    }

    /// Remaining cooldown, if open.
    pub fn open_remaining(&self) -> Option<Duration> {
        self.open_until.map(|until| {
            Duration::from_millis(until.saturating_sub(self.clock.now_mono()))
        })
    }

    fn record_failure(&mut self, unreachable: bool) {
        self.consecutive_failures += 1;
        self.streak_unreachable |= unreachable;

        match self.state {
            CircuitState::HalfOpen => self.open("probe failed"),
            CircuitState::Closed => {
                if self.dns_failures >= self.threshold {
                    self.open("dns resolution failures");
                } else if self.consecutive_failures >= self.threshold && self.streak_unreachable {
                    self.open("connection failures");
                } else {
                    debug!(
                        failures = self.consecutive_failures,
                        threshold = self.threshold,
                        "delivery failure recorded"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, reason: &str) {
        if self.state == CircuitState::Open {
            return;
        }
        self.state = CircuitState::Open;
        self.open_until = Some(self.clock.now_mono() + self.cooldown.as_millis() as u64);
        self.opens += 1;
        warn!(
            reason,
            failures = self.consecutive_failures,
            dns_failures = self.dns_failures,
            cooldown_secs = self.cooldown.as_secs(),
            "circuit breaker opened"
        );
    }
}
