//! Per-endpoint-group circuit breakers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use crate::observability::{Telemetry, TelemetryEvent};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed (normal operation).
    Closed,
    /// Circuit is open (failing fast).
    Open,
    /// Circuit is half-open (one trial call allowed).
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

type Transition = Option<(CircuitState, CircuitState)>;

impl BreakerInner {
    fn set(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some((from, to))
    }

    fn open(&mut self, now: Instant) -> Transition {
        self.opened_at = Some(now);
        self.failures.clear();
        self.trial_in_flight = false;
        self.set(CircuitState::Open)
    }
}

/// Circuit breaker guarding one endpoint group.
///
/// Opens after `failure_threshold` consecutive failures inside
/// `failure_window`, rejects calls for `cooldown`, then lets exactly one
/// trial call through. The trial's outcome closes or re-opens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    group: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    telemetry: Telemetry,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(group: impl Into<String>, config: CircuitBreakerConfig, telemetry: Telemetry) -> Self {
        Self {
            group: group.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
            telemetry,
        }
    }

    /// Endpoint group.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Current state. An open circuit past its cooldown reports half-open.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) if at.elapsed() >= self.config.cooldown => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Asks to make a call.
    ///
    /// # Errors
    ///
    /// Returns a local `CircuitOpen` error while the circuit is open or while
    /// the half-open trial is still running.
    pub fn try_acquire(self: &Arc<Self>) -> GitHubResult<CircuitPermit> {
        if !self.config.enabled {
            return Ok(CircuitPermit::new(Arc::clone(self), false));
        }

        let now = Instant::now();
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let mut transition = None;
            if inner.state == CircuitState::Open {
                let opened = inner.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened) >= self.config.cooldown {
                    transition = inner.set(CircuitState::HalfOpen);
                }
            }
            let result = match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::HalfOpen if !inner.trial_in_flight => {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
                CircuitState::HalfOpen => Err(self.config.cooldown),
                CircuitState::Open => {
                    let opened = inner.opened_at.unwrap_or(now);
                    Err(self
                        .config
                        .cooldown
                        .saturating_sub(now.saturating_duration_since(opened)))
                }
            };
            (result, transition)
        };

        self.emit(transition);
        match result {
            Ok(trial) => Ok(CircuitPermit::new(Arc::clone(self), trial)),
            Err(retry_after) => {
                self.telemetry.emit(TelemetryEvent::CircuitRejected {
                    group: self.group.clone(),
                });
                Err(GitHubError::new(
                    GitHubErrorKind::CircuitOpen,
                    format!("circuit open for {}", self.group),
                )
                .with_retry_after(retry_after)
                .local())
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            if trial {
                inner.trial_in_flight = false;
                inner.failures.clear();
                inner.opened_at = None;
                inner.set(CircuitState::Closed)
            } else {
                if inner.state == CircuitState::Closed {
                    inner.failures.clear();
                }
                None
            }
        };
        self.emit(transition);
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            if trial {
                inner.open(now)
            } else if inner.state == CircuitState::Closed {
                let window = self.config.failure_window;
                while let Some(front) = inner.failures.front() {
                    if now.saturating_duration_since(*front) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                inner.failures.push_back(now);
                if inner.failures.len() as u32 >= self.config.failure_threshold.max(1) {
                    inner.open(now)
                } else {
                    None
                }
            } else {
                None
            }
        };
        self.emit(transition);
    }

    fn on_abandon(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }

    fn emit(&self, transition: Transition) {
        if let Some((from, to)) = transition {
            self.telemetry.emit(TelemetryEvent::CircuitTransition {
                group: self.group.clone(),
                from,
                to,
            });
        }
    }

    /// Forces the breaker closed.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failures.clear();
            inner.opened_at = None;
            inner.trial_in_flight = false;
            inner.set(CircuitState::Closed)
        };
        self.emit(transition);
    }
}

/// Permission to make one call through a breaker.
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping the permit without reporting leaves
/// the breaker's counters untouched and frees the half-open trial slot.
#[derive(Debug)]
#[must_use]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The endpoint answered healthily.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// The endpoint failed.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.trial);
        }
    }
}

/// Breakers keyed by endpoint group, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    telemetry: Telemetry,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    pub fn new(config: CircuitBreakerConfig, telemetry: Telemetry) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            telemetry,
        }
    }

    /// Breaker for `group`.
    pub fn get(&self, group: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(group) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(group.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                group,
                self.config.clone(),
                self.telemetry.clone(),
            ))
        }))
    }

    /// State of every known group, sorted by group.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .read()
            .iter()
            .map(|(group, breaker)| (group.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
