//! Circuit breaker for provider calls.
//!
//! State machine: Closed → Open → Probe → (Closed | Open)
//! - Closed: every call passes. Consecutive failures are counted.
//! - Open: reached after `threshold` consecutive failures. Calls fail fast
//!   with [`RelayError::CircuitOpen`] and never touch the network.
//! - Probe: once the cooldown since opening has elapsed *and* the probe
//!   interval since the last probe has elapsed, exactly one call is let
//!   through. Success closes the breaker; failure leaves it open without
//!   moving `opened_at`, so the outage window is measured from the first trip.
//!
//! Any success, in any state, resets the failure count and clears
//! `opened_at`.

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::{RelayError, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Raw breaker bookkeeping.
///
/// `opened_at` is only ever set while `consecutive_failures >= threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub last_probe_at: Option<Instant>,
}

/// Observable phase, derived from [`BreakerState`] and the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    /// Open, but the next call would be admitted as a probe.
    Probe,
}

/// Why a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; normal call.
    Pass,
    /// The single trial call of this probe window.
    Probe,
}

/// A consecutive-failure breaker with an injectable clock.
///
/// Shared by reference between concurrent calls of one invoker; the
/// internal lock is never held across an await point.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Time until a probe becomes admissible, or zero if it already is.
    fn probe_wait(&self, state: &BreakerState, now: Instant) -> Duration {
        let Some(opened_at) = state.opened_at else {
            return Duration::ZERO;
        };
        let cooldown_ends = opened_at + self.config.cooldown;
        let probe_ends = state
            .last_probe_at
            .map(|t| t + self.config.probe_interval)
            .unwrap_or(cooldown_ends);
        cooldown_ends
            .max(probe_ends)
            .saturating_duration_since(now)
    }

    /// Decide whether a call may go out.
    ///
    /// Returns [`RelayError::CircuitOpen`] when the breaker is open and no
    /// probe is due. Admitting a probe stamps `last_probe_at`, so concurrent
    /// callers cannot both get one.
    pub fn admit(&self) -> Result<Admission> {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.opened_at.is_none() {
            return Ok(Admission::Pass);
        }
        let wait = self.probe_wait(&state, now);
        if wait.is_zero() {
            state.last_probe_at = Some(now);
            tracing::info!(
                failures = state.consecutive_failures,
                "circuit breaker admitting probe"
            );
            Ok(Admission::Probe)
        } else {
            tracing::debug!(retry_in = ?wait, "circuit breaker short-circuited call");
            Err(RelayError::CircuitOpen { retry_in: wait })
        }
    }

    /// Record a successful call. Closes the breaker from any phase.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.opened_at.is_some() {
            tracing::info!(
                failures = state.consecutive_failures,
                "circuit breaker recovered, transitioning to Closed"
            );
        }
        *state = BreakerState::default();
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.opened_at.is_none() && state.consecutive_failures >= self.config.threshold {
            state.opened_at = Some(now);
            tracing::warn!(
                failures = state.consecutive_failures,
                threshold = self.config.threshold,
                cooldown = ?self.config.cooldown,
                "circuit breaker tripped, transitioning to Open"
            );
        } else if state.opened_at.is_some() {
            tracing::warn!(
                failures = state.consecutive_failures,
                "probe failed, circuit breaker stays Open"
            );
        }
    }

    pub fn phase(&self) -> BreakerPhase {
        let now = self.clock.now();
        let state = self.lock();
        match state.opened_at {
            None => BreakerPhase::Closed,
            Some(_) if self.probe_wait(&state, now).is_zero() => BreakerPhase::Probe,
            Some(_) => BreakerPhase::Open,
        }
    }

    /// Copy of the current bookkeeping.
    pub fn state(&self) -> BreakerState {
        *self.lock()
    }
}
