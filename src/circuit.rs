//! Circuit Breakers
//!
//! Per-scope failure isolation. A scope is a tier name (`tier:vector`) or a
//! provider slot (`openai/0`). Breakers live in a registry and are only mutated
//! through `allow`, `record_success` and `record_failure`.
//!
//! State machine:
//! - Closed -> Open after `failure_threshold` consecutive failures
//! - Open -> HalfOpen once `cooldown` has elapsed (on the next `allow`)
//! - HalfOpen -> Closed on success, HalfOpen -> Open on failure
//!
//! While HalfOpen exactly one trial call is admitted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failures exceeded, blocking calls
    HalfOpen, // One trial call in flight
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Breaker for a single scope
#[derive(Debug)]
pub struct CircuitBreaker {
    scope: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

impl CircuitBreaker {
    pub fn new(scope: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            scope: scope.to_string(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
            last_failure: None,
            last_state_change: Instant::now(),
        }
    }

    /// Check if the circuit admits a call
    ///
    /// Consumes the HalfOpen trial when it returns true in that state.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.cooldown_elapsed() {
                    self.transition_to(CircuitState::HalfOpen);
                    self.trial_started = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back is abandoned after one cooldown
                match self.trial_started {
                    Some(started) if started.elapsed() < self.config.cooldown => false,
                    _ => {
                        self.trial_started = Some(Instant::now());
                        true
                    }
                }
            }
        }
    }

    /// Whether `allow` would currently refuse, without consuming a trial
    pub fn is_open(&self) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => !self.cooldown_elapsed(),
            CircuitState::HalfOpen => self
                .trial_started
                .map(|started| started.elapsed() < self.config.cooldown)
                .unwrap_or(false),
        }
    }

    /// Time until `allow` would admit a call again; `None` when it already would
    pub fn retry_after(&self) -> Option<Duration> {
        if !self.is_open() {
            return None;
        }
        let since = match self.state {
            CircuitState::HalfOpen => self.trial_started,
            _ => self.opened_at,
        }?;
        Some(self.config.cooldown.saturating_sub(since.elapsed()))
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Closed);
            }
            CircuitState::Open => {
                // Late result from a call admitted before the breaker opened
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());

        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures += 1;
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {
                self.consecutive_failures += 1;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            scope: self.scope.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            threshold: self.config.failure_threshold,
            cooldown: self.config.cooldown,
            time_in_state: self.last_state_change.elapsed(),
            last_failure: self.last_failure.map(|f| f.elapsed()),
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.opened_at
            .map(|opened| opened.elapsed() >= self.config.cooldown)
            .unwrap_or(true)
    }

    fn transition_to(&mut self, state: CircuitState) {
        info!(
            scope = %self.scope,
            from = ?self.state,
            to = ?state,
            at = %chrono::Utc::now().to_rfc3339(),
            "Circuit breaker transition"
        );
        self.state = state;
        self.last_state_change = Instant::now();

        match state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.trial_started = None;
            }
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.trial_started = None;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub scope: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub cooldown: Duration,
    pub time_in_state: Duration,
    pub last_failure: Option<Duration>,
}

/// Breakers keyed by scope, created lazily in the Closed state
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, scope: &str) -> bool {
        let mut breakers = self.breakers.lock();
        let allowed = self.breaker(&mut breakers, scope).allow();
        if !allowed {
            debug!("Circuit refused call for {}", scope);
        }
        allowed
    }

    pub fn record_success(&self, scope: &str) {
        let mut breakers = self.breakers.lock();
        self.breaker(&mut breakers, scope).record_success();
    }

    pub fn record_failure(&self, scope: &str) {
        let mut breakers = self.breakers.lock();
        self.breaker(&mut breakers, scope).record_failure();
    }

    pub fn is_open(&self, scope: &str) -> bool {
        let breakers = self.breakers.lock();
        breakers.get(scope).map(|b| b.is_open()).unwrap_or(false)
    }

    pub fn retry_after(&self, scope: &str) -> Option<Duration> {
        let breakers = self.breakers.lock();
        breakers.get(scope).and_then(|b| b.retry_after())
    }

    pub fn state(&self, scope: &str) -> CircuitState {
        let breakers = self.breakers.lock();
        breakers
            .get(scope)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn stats(&self, scope: &str) -> Option<CircuitStats> {
        let breakers = self.breakers.lock();
        breakers.get(scope).map(|b| b.stats())
    }

    /// Stats for every scope seen so far, sorted by scope
    pub fn snapshot(&self) -> Vec<CircuitStats> {
        let breakers = self.breakers.lock();
        let mut all: Vec<CircuitStats> = breakers.values().map(|b| b.stats()).collect();
        all.sort_by(|a, b| a.scope.cmp(&b.scope));
        all
    }

    fn breaker<'a>(
        &self,
        breakers: &'a mut HashMap<String, CircuitBreaker>,
        scope: &str,
    ) -> &'a mut CircuitBreaker {
        breakers
            .entry(scope.to_string())
            .or_insert_with(|| CircuitBreaker::new(scope, self.config.clone()))
    }
}
