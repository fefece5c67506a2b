//! Circuit breakers keyed by logical target (usually `node_<type>`).
//!
//! The circuit breaker stops calling a failing dependency for a cooldown
//! period so it can recover, and so callers fail fast meanwhile.
//!
//! ## States
//!
//! - **Closed**: Normal operation, calls pass through and outcomes are counted
//! - **Open**: Calls fail immediately with [`Error::CircuitOpen`]
//! - **HalfOpen**: Up to `max_half_open_requests` trial calls; that many
//!   consecutive successes close the circuit, any failure reopens it
//!
//! ## Configuration
//!
//! - `ready_to_trip`: decides the closed -> open transition from [`Counts`]
//!   (default: more than 3 consecutive failures)
//! - `reset_interval`: how often closed-state counts are cleared (default: 60s)
//! - `open_timeout`: how long to stay open before half-open (default: 60s)

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Service failing - requests rejected immediately
    Open,
    /// Testing recovery - limited requests allowed
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome counters for the current window. Cleared on every state change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Calls short-circuited while open or over the half-open limit
    pub rejections: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Trip predicate evaluated after each closed-state failure.
pub type ReadyToTrip = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Callback invoked as `(name, from, to)` on every state change.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Trial calls admitted while half-open
    pub max_half_open_requests: u32,
    /// Closed-state count window; zero keeps counts until a state change
    pub reset_interval: Duration,
    /// Time spent open before moving to half-open
    pub open_timeout: Duration,
    pub ready_to_trip: ReadyToTrip,
    pub on_state_change: Option<StateChangeHook>,
}

impl CircuitBreakerConfig {
    /// Defaults: 3 half-open trials, 60s window, 60s open timeout, trip
    /// after more than 3 consecutive failures.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_half_open_requests: 3,
            reset_interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(60),
            ready_to_trip: consecutive_failures_above(3),
            on_state_change: None,
        }
    }

    /// Defaults for a per-node-type breaker: 30s open timeout, trip after
    /// more than 2 consecutive failures.
    pub fn for_node_type(node_type: &str) -> Self {
        Self::new(node_key(node_type))
            .with_open_timeout(Duration::from_secs(30))
            .trip_after(2)
    }

    /// Trip once consecutive failures exceed `threshold`.
    pub fn trip_after(mut self, threshold: u32) -> Self {
        self.ready_to_trip = consecutive_failures_above(threshold);
        self
    }

    pub fn with_ready_to_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Arc::new(predicate);
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_reset_interval(mut self, interval: Duration) -> Self {
        self.reset_interval = interval;
        self
    }

    pub fn with_max_half_open_requests(mut self, max: u32) -> Self {
        self.max_half_open_requests = max.max(1);
        self
    }

    pub fn with_state_change_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("reset_interval", &self.reset_interval)
            .field("open_timeout", &self.open_timeout)
            .finish_non_exhaustive()
    }
}

fn consecutive_failures_above(threshold: u32) -> ReadyToTrip {
    Arc::new(move |counts: &Counts| counts.consecutive_failures > threshold)
}

/// Breaker key for a node type.
pub fn node_key(node_type: &str) -> String {
    format!("node_{}", node_type)
}

/// How a guarded call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Cancelled by the caller; says nothing about the dependency's health
    Neutral,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    counts: Counts,
    generation: u64,
    expiry: Option<Instant>,
}

type Transition = (CircuitState, CircuitState);

/// Circuit breaker for a single key.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let expiry = Self::closed_expiry(&config, Instant::now());
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                counts: Counts::default(),
                generation: 0,
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn closed_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
        if config.reset_interval.is_zero() {
            None
        } else {
            Some(now + config.reset_interval)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `to`, starting a new generation. Returns the transition if the
    /// state actually changed.
    fn set_state(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) -> Option<Transition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match to {
            CircuitState::Closed => Self::closed_expiry(&self.config, now),
            CircuitState::Open => Some(now + self.config.open_timeout),
            CircuitState::HalfOpen => None,
        };
        Some((from, to))
    }

    /// Apply time-based transitions (open -> half-open, closed window reset).
    fn refresh(&self, inner: &mut BreakerState, now: Instant) -> Option<Transition> {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|at| at <= now) {
                    inner.generation += 1;
                    inner.counts = Counts::default();
                    inner.expiry = Self::closed_expiry(&self.config, now);
                }
                None
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|at| at <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => None,
        }
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!(
                breaker = %self.config.name,
                from = %from,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(breaker = %self.config.name, "Circuit breaker half-open"),
            CircuitState::Closed => info!(breaker = %self.config.name, "Circuit breaker closed after recovery"),
        }
        metrics::set_circuit_state(&self.config.name, to.as_gauge());
        if let Some(hook) = &self.config.on_state_change {
            hook(&self.config.name, from, to);
        }
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Snapshot of the current window's counts.
    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        let transition = self.refresh(&mut inner, Instant::now());
        let counts = inner.counts;
        drop(inner);
        self.notify(transition);
        counts
    }

    /// Admit or reject a call. Returns the generation to report back with.
    fn before_call(&self) -> Result<u64> {
        let (admitted, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            let admitted = match inner.state {
                CircuitState::Open => false,
                CircuitState::HalfOpen => inner.counts.requests < self.config.max_half_open_requests,
                CircuitState::Closed => true,
            };
            if admitted {
                inner.counts.requests += 1;
                (Ok(inner.generation), transition)
            } else {
                inner.counts.rejections += 1;
                inner.counts.total_failures += 1;
                (Err(Error::CircuitOpen(self.config.name.clone())), transition)
            }
        };
        self.notify(transition);
        admitted
    }

    /// Fold an outcome into the counts of the current generation.
    fn apply_outcome(
        &self,
        inner: &mut BreakerState,
        outcome: Outcome,
        now: Instant,
    ) -> Option<Transition> {
        let next = match (inner.state, outcome) {
            (_, Outcome::Neutral) => {
                inner.counts.requests = inner.counts.requests.saturating_sub(1);
                None
            }
            (CircuitState::Closed, Outcome::Success) => {
                inner.counts.on_success();
                None
            }
            (CircuitState::Closed, Outcome::Failure) => {
                inner.counts.on_failure();
                (self.config.ready_to_trip)(&inner.counts).then_some(CircuitState::Open)
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                inner.counts.on_success();
                (inner.counts.consecutive_successes >= self.config.max_half_open_requests)
                    .then_some(CircuitState::Closed)
            }
            (CircuitState::HalfOpen, Outcome::Failure) => Some(CircuitState::Open),
            (CircuitState::Open, _) => None,
        };
        next.and_then(|to| self.set_state(inner, to, now))
    }

    /// Report the outcome of an admitted call. Outcomes from an older
    /// generation (the state changed meanwhile) are dropped.
    fn after_call(&self, generation: u64, outcome: Outcome) {
        let (refreshed, applied) = {
            let now = Instant::now();
            let mut inner = self.lock();
            let refreshed = self.refresh(&mut inner, now);
            let applied = if inner.generation == generation {
                self.apply_outcome(&mut inner, outcome, now)
            } else {
                None
            };
            (refreshed, applied)
        };
        self.notify(refreshed);
        self.notify(applied);
    }

    fn record(&self, outcome: Outcome) {
        let (refreshed, applied) = {
            let now = Instant::now();
            let mut inner = self.lock();
            let refreshed = self.refresh(&mut inner, now);
            let applied = self.apply_outcome(&mut inner, outcome, now);
            (refreshed, applied)
        };
        self.notify(refreshed);
        self.notify(applied);
    }

    /// Record a successful call made outside [`CircuitBreaker::call`].
    pub fn record_success(&self) {
        self.record(Outcome::Success);
    }

    /// Record a failed call made outside [`CircuitBreaker::call`].
    pub fn record_failure(&self) {
        self.record(Outcome::Failure);
    }

    /// Whether a call would currently be admitted.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.lock().counts.requests < self.config.max_half_open_requests,
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Rejected calls fail with [`Error::CircuitOpen`] without running `f`.
    /// Cancellation errors are not counted either way.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let generation = match self.before_call() {
            Ok(generation) => generation,
            Err(e) => {
                metrics::record_circuit_rejection(&self.config.name);
                return Err(e);
            }
        };

        let result = f().await;
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(Error::Cancelled(_)) => Outcome::Neutral,
            Err(_) => Outcome::Failure,
        };
        self.after_call(generation, outcome);
        result
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let transition = {
            let now = Instant::now();
            let mut inner = self.lock();
            let transition = self.set_state(&mut inner, CircuitState::Closed, now);
            inner.generation += 1;
            inner.counts = Counts::default();
            inner.expiry = Self::closed_expiry(&self.config, now);
            transition
        };
        self.notify(transition);
    }
}

/// One breaker per key, created on first use.
pub struct CircuitBreakerManager {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    node_type_config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    /// Create a manager with the built-in defaults.
    pub fn new() -> Self {
        Self::with_configs(
            CircuitBreakerConfig::new("default"),
            CircuitBreakerConfig::for_node_type("default"),
        )
    }

    /// Create a manager with templates for generic keys and node-type keys.
    /// Template names are replaced by the key on creation.
    pub fn with_configs(
        default_config: CircuitBreakerConfig,
        node_type_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            default_config,
            node_type_config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a breaker under `config.name`.
    pub fn add_circuit_breaker(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(config));
        self.lock()
            .insert(breaker.name().to_string(), breaker.clone());
        breaker
    }

    /// Get or create the breaker for `key` from the default template.
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.default_config.renamed(key))))
            .clone()
    }

    /// Get or create the breaker for a node type (`node_<type>`).
    pub fn for_node_type(&self, node_type: &str) -> Arc<CircuitBreaker> {
        let key = node_key(node_type);
        self.lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.node_type_config.renamed(&key))))
            .clone()
    }

    /// Run `f` through the breaker for `key`, creating a default one if needed.
    pub async fn execute_with_circuit_breaker<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.get_or_create(key);
        breaker.call(f).await
    }

    /// Run `f` through the breaker for a node type.
    pub async fn execute_for_node_type<T, F, Fut>(&self, node_type: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.for_node_type(node_type);
        breaker.call(f).await
    }

    fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(key).cloned()
    }

    /// True if a breaker exists for `key` and is open.
    pub fn is_circuit_open(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|breaker| breaker.state() == CircuitState::Open)
    }

    /// Force a breaker back to closed.
    pub fn reset_circuit(&self, key: &str) -> Result<()> {
        let breaker = self
            .get(key)
            .ok_or_else(|| Error::CircuitNotFound(key.to_string()))?;
        breaker.reset();
        Ok(())
    }

    pub fn get_circuit_state(&self, key: &str) -> Result<CircuitState> {
        self.get(key)
            .map(|breaker| breaker.state())
            .ok_or_else(|| Error::CircuitNotFound(key.to_string()))
    }

    /// Registered keys, sorted.
    pub fn circuit_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(name: &str) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(name)
            .trip_after(3)
            .with_open_timeout(Duration::from_millis(50))
            .with_max_half_open_requests(1)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err(Error::node_execution("down")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[test]
    fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new("svc"));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[tokio::test]
    async fn test_fifth_call_rejected_without_invocation() {
        let manager = CircuitBreakerManager::new();
        manager.add_circuit_breaker(CircuitBreakerConfig::new("node_http").trip_after(3));
        let invocations = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = invocations.clone();
            let result: Result<()> = manager
                .execute_with_circuit_breaker("node_http", || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::node_execution("boom"))
                })
                .await;
            assert!(matches!(result, Err(Error::NodeExecution { .. })));
        }

        let counter = invocations.clone();
        let result: Result<()> = manager
            .execute_with_circuit_breaker("node_http", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen(ref key)) if key == "node_http"));
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
        assert!(manager.is_circuit_open("node_http"));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new(quick("svc"));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        succeed(&cb).await.unwrap();
        assert_eq!(cb.counts().consecutive_failures, 0);

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let cb = CircuitBreaker::new(quick("svc"));
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(quick("svc"));
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(succeed(&cb).await, Err(Error::CircuitOpen(_))));
    }

    #[test]
    fn test_half_open_limits_trial_requests() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("svc")
                .trip_after(0)
                .with_open_timeout(Duration::from_millis(10))
                .with_max_half_open_requests(2),
        );
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.before_call().is_ok());
        assert!(cb.before_call().is_ok());
        assert!(matches!(cb.before_call(), Err(Error::CircuitOpen(_))));
        assert_eq!(cb.counts().rejections, 1);
    }

    #[tokio::test]
    async fn test_cancellation_is_neutral() {
        let cb = CircuitBreaker::new(quick("svc").trip_after(0));
        let result: Result<()> = cb
            .call(|| async { Err(Error::Cancelled("stop".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().requests, 0);
    }

    #[test]
    fn test_state_change_hook_fires() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("svc")
                .trip_after(0)
                .with_state_change_hook(move |name, from, to| {
                    seen.lock().unwrap().push((name.to_string(), from, to));
                }),
        );

        cb.record_failure();
        cb.reset();

        let transitions = transitions.lock().unwrap();
        assert_eq!(
            *transitions,
            vec![
                ("svc".to_string(), CircuitState::Closed, CircuitState::Open),
                ("svc".to_string(), CircuitState::Open, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_closed_counts_clear_after_interval() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("svc")
                .trip_after(2)
                .with_reset_interval(Duration::from_millis(10)),
        );
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().consecutive_failures, 1);
    }

    #[test]
    fn test_manager_reset_and_state() {
        let manager = CircuitBreakerManager::new();
        assert!(matches!(
            manager.reset_circuit("nope"),
            Err(Error::CircuitNotFound(_))
        ));
        assert!(manager.get_circuit_state("nope").is_err());
        assert!(!manager.is_circuit_open("nope"));

        let breaker = manager.for_node_type("http_request");
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(
            manager.get_circuit_state("node_http_request").unwrap(),
            CircuitState::Open
        );

        manager.reset_circuit("node_http_request").unwrap();
        assert_eq!(
            manager.get_circuit_state("node_http_request").unwrap(),
            CircuitState::Closed
        );
        assert_eq!(manager.circuit_keys(), vec!["node_http_request"]);
    }

    #[test]
    fn test_node_type_defaults_trip_earlier() {
        let manager = CircuitBreakerManager::new();
        let node_breaker = manager.for_node_type("delay");
        let generic = manager.get_or_create("external");
        for _ in 0..3 {
            node_breaker.record_failure();
            generic.record_failure();
        }
        assert_eq!(node_breaker.state(), CircuitState::Open);
        assert_eq!(generic.state(), CircuitState::Closed);
    }
}
