//! Retry policy and backoff.
//!
//! A [`RetryStrategy`] bounds how many times a failed node attempt is
//! repeated and how long to wait in between. Strategies are registered by
//! name on a [`RetryManager`]; unknown names fall back to `"default"`.
//!
//! ## Backoff
//!
//! - `fixed`: constant `base_delay`
//! - `linear`: `(attempt + 1) * base_delay`
//! - `exponential`: `base_delay * multiplier^attempt`, capped at `max_delay`
//! - `random`: uniform in `[base_delay, max_delay]` (`max_delay` defaults to `10 * base_delay`)
//!
//! With `jitter` set the delay is stretched by up to 10%.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Name of the fallback strategy.
pub const DEFAULT_STRATEGY: &str = "default";

/// Backoff curve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Fixed,
    Linear,
    #[default]
    Exponential,
    Random,
}

impl std::str::FromStr for BackoffType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            "random" => Ok(Self::Random),
            _ => Err(format!("Unknown backoff type: {}", s)),
        }
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffStrategy {
    pub backoff_type: BackoffType,
    pub base_delay: Duration,
    /// Cap for exponential, upper bound for random. Zero means unbounded.
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            backoff_type: BackoffType::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl BackoffStrategy {
    /// Constant delay without jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff_type: BackoffType::Fixed,
            base_delay: delay,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt + 1`, jitter excluded.
    ///
    /// `attempt` is zero-based: the wait after the first failure uses 0.
    /// `random` backoff is still random here.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        match self.backoff_type {
            BackoffType::Fixed => self.base_delay,
            BackoffType::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            BackoffType::Exponential => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let delay =
                    secs_to_duration(self.base_delay.as_secs_f64() * self.multiplier.powi(exponent));
                if self.max_delay > Duration::ZERO && delay > self.max_delay {
                    self.max_delay
                } else {
                    delay
                }
            }
            BackoffType::Random => {
                let base = self.base_delay.as_secs_f64();
                let max = if self.max_delay.is_zero() {
                    base * 10.0
                } else {
                    self.max_delay.as_secs_f64()
                };
                if max <= base {
                    return self.base_delay;
                }
                secs_to_duration(rand::thread_rng().gen_range(base..=max))
            }
        }
    }

    /// Delay before retry number `attempt + 1`, including jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen::<f64>() * 0.1;
        secs_to_duration(delay.as_secs_f64() * factor)
    }
}

/// Narrows when (and how often) a failure is retried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryCondition {
    /// Substring of the rendered error message. Matching ignores case, so
    /// `"connection reset"` also hits `Node execution failed: Connection reset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_match: Option<String>,

    /// Status codes reported by the node
    #[serde(default)]
    pub status_codes: Vec<u16>,

    /// Node types this condition applies to; empty means all
    #[serde(default)]
    pub node_types: Vec<String>,

    /// Tighter retry ceiling for errors matching this condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl RetryCondition {
    /// Match on an error message substring.
    pub fn error_contains(pattern: impl Into<String>) -> Self {
        Self {
            error_match: Some(pattern.into()),
            ..Self::default()
        }
    }

    /// Match on status codes.
    pub fn status_codes(codes: &[u16]) -> Self {
        Self {
            status_codes: codes.to_vec(),
            ..Self::default()
        }
    }

    pub fn for_node_types(mut self, types: &[&str]) -> Self {
        self.node_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    fn applies_to(&self, node_type: &str) -> bool {
        self.node_types.is_empty() || self.node_types.iter().any(|t| t == node_type)
    }

    fn matches(&self, err: &Error) -> bool {
        let message_hit = self.error_match.as_ref().is_some_and(|pattern| {
            err.to_string()
                .to_lowercase()
                .contains(&pattern.to_lowercase())
        });
        let status_hit = err
            .status_code()
            .is_some_and(|code| self.status_codes.contains(&code));
        message_hit || status_hit
    }
}

/// Retry policy for one class of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    /// Checked in declaration order; first match decides
    pub conditions: Vec<RetryCondition>,
    /// Per-attempt time limit
    pub timeout: Option<Duration>,
}

impl RetryStrategy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::fixed(Duration::ZERO),
            conditions: Vec::new(),
            timeout: None,
        }
    }

    /// Fixed-delay strategy with no conditions.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::fixed(delay),
            conditions: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.conditions.push(condition);
        self
    }
}

impl Default for RetryStrategy {
    /// Three exponential retries; transient network failures and 5xx
    /// responses from `http_request` nodes are named explicitly.
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::default(),
            conditions: vec![
                RetryCondition::error_contains("timeout"),
                RetryCondition::error_contains("connection refused"),
                RetryCondition::status_codes(&[500, 502, 503, 504])
                    .for_node_types(&["http_request"]),
            ],
            timeout: None,
        }
    }
}

/// Named retry strategies plus the retry loop.
pub struct RetryManager {
    strategies: RwLock<HashMap<String, RetryStrategy>>,
}

impl RetryManager {
    /// Create a manager with the built-in default strategy.
    pub fn new() -> Self {
        Self::with_default(RetryStrategy::default())
    }

    /// Create a manager with a custom `"default"` strategy.
    pub fn with_default(strategy: RetryStrategy) -> Self {
        let mut strategies = HashMap::new();
        strategies.insert(DEFAULT_STRATEGY.to_string(), strategy);
        Self {
            strategies: RwLock::new(strategies),
        }
    }

    /// Register (or replace) a named strategy.
    pub fn add_strategy(&self, name: &str, strategy: RetryStrategy) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), strategy);
    }

    /// Remove a named strategy. The default strategy cannot be removed.
    pub fn remove_strategy(&self, name: &str) -> bool {
        if name == DEFAULT_STRATEGY {
            return false;
        }
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Look up a strategy, falling back to `"default"`.
    pub fn strategy(&self, name: &str) -> RetryStrategy {
        let strategies = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        strategies
            .get(name)
            .or_else(|| strategies.get(DEFAULT_STRATEGY))
            .cloned()
            .unwrap_or_else(RetryStrategy::none)
    }

    /// Decide whether failure number `attempt + 1` should be retried.
    ///
    /// Returns the backoff delay when a retry is allowed. `attempt` is
    /// zero-based, so the first failure is attempt 0.
    pub fn should_retry(
        &self,
        strategy: &RetryStrategy,
        attempt: u32,
        err: &Error,
        node_type: &str,
    ) -> Option<Duration> {
        if attempt >= strategy.max_retries {
            return None;
        }
        if matches!(err, Error::Cancelled(_) | Error::CircuitOpen(_)) {
            return None;
        }

        for condition in &strategy.conditions {
            if !condition.applies_to(node_type) || !condition.matches(err) {
                continue;
            }
            if condition.max_retries.is_some_and(|max| attempt >= max) {
                return None;
            }
            return Some(strategy.backoff.delay_for(attempt));
        }

        Some(strategy.backoff.delay_for(attempt))
    }

    /// Run `op` until it succeeds or the strategy gives up.
    ///
    /// `op` receives the 1-based attempt number. Each attempt is bounded by
    /// `strategy.timeout`. Cancellation of `cancel` aborts an in-flight
    /// attempt or backoff sleep immediately with [`Error::Cancelled`]. After
    /// more than one attempt, the final failure is wrapped in
    /// [`Error::RetryExhausted`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        strategy: &RetryStrategy,
        node_type: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("retry loop aborted".to_string()));
            }

            let call = op(attempt + 1);
            let outcome = match strategy.timeout {
                Some(limit) => tokio::select! {
                    result = tokio::time::timeout(limit, call) => match result {
                        Ok(inner) => inner,
                        Err(_) => Err(Error::Timeout(format!(
                            "attempt {} exceeded {:?}",
                            attempt + 1,
                            limit
                        ))),
                    },
                    _ = cancel.cancelled() => Err(Error::Cancelled("attempt interrupted".to_string())),
                },
                None => tokio::select! {
                    result = call => result,
                    _ = cancel.cancelled() => Err(Error::Cancelled("attempt interrupted".to_string())),
                },
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(node_type, attempts = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!(
                    "cancelled during attempt {}: {}",
                    attempt + 1,
                    err
                )));
            }

            let Some(delay) = self.should_retry(strategy, attempt, &err, node_type) else {
                return Err(if attempt > 0 {
                    Error::RetryExhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    }
                } else {
                    err
                });
            };

            warn!(
                node_type,
                attempt = attempt + 1,
                max_retries = strategy.max_retries,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying node"
            );
            metrics::record_node_retry(node_type);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("retry backoff interrupted".to_string()));
                }
            }
            attempt += 1;
        }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(backoff_type: BackoffType) -> BackoffStrategy {
        BackoffStrategy {
            backoff_type,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn fast(max_retries: u32) -> RetryStrategy {
        RetryStrategy::fixed(max_retries, Duration::from_millis(1))
    }

    // ========================================================================
    // Backoff Tests
    // ========================================================================

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = no_jitter(BackoffType::Exponential);
        let delays: Vec<u64> = (0..8).map(|a| backoff.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_exponential_backoff_huge_attempt_does_not_overflow() {
        let mut backoff = no_jitter(BackoffType::Exponential);
        assert_eq!(backoff.delay_for(10_000), Duration::from_secs(30));

        backoff.max_delay = Duration::ZERO;
        assert_eq!(backoff.delay_for(10_000), Duration::MAX);
    }

    #[test]
    fn test_fixed_and_linear_backoff() {
        let fixed = no_jitter(BackoffType::Fixed);
        assert_eq!(fixed.delay_for(0), Duration::from_secs(1));
        assert_eq!(fixed.delay_for(5), Duration::from_secs(1));

        let linear = no_jitter(BackoffType::Linear);
        assert_eq!(linear.delay_for(0), Duration::from_secs(1));
        assert_eq!(linear.delay_for(2), Duration::from_secs(3));
    }

    #[test]
    fn test_random_backoff_within_bounds() {
        let mut backoff = no_jitter(BackoffType::Random);
        backoff.max_delay = Duration::from_secs(3);
        for attempt in 0..50 {
            let delay = backoff.delay_for(attempt);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }

        backoff.max_delay = Duration::ZERO;
        for attempt in 0..50 {
            assert!(backoff.delay_for(attempt) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_jitter_adds_at_most_ten_percent() {
        let mut backoff = no_jitter(BackoffType::Fixed);
        backoff.jitter = true;
        for _ in 0..100 {
            let delay = backoff.delay_for(0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    // ========================================================================
    // ShouldRetry Tests
    // ========================================================================

    #[test]
    fn test_should_retry_respects_max() {
        let manager = RetryManager::new();
        let strategy = fast(2);
        let err = Error::node_execution("boom");

        assert!(manager.should_retry(&strategy, 0, &err, "any").is_some());
        assert!(manager.should_retry(&strategy, 1, &err, "any").is_some());
        assert!(manager.should_retry(&strategy, 2, &err, "any").is_none());
    }

    #[test]
    fn test_condition_override_limits_retries() {
        let manager = RetryManager::new();
        let strategy =
            fast(5).with_condition(RetryCondition::error_contains("rate limited").with_max_retries(1));
        let limited = Error::node_execution("Rate Limited by upstream");
        let other = Error::node_execution("boom");

        assert!(manager.should_retry(&strategy, 0, &limited, "http").is_some());
        assert!(manager.should_retry(&strategy, 1, &limited, "http").is_none());
        // Unmatched errors fall through to the global budget
        assert!(manager.should_retry(&strategy, 3, &other, "http").is_some());
    }

    #[test]
    fn test_error_match_ignores_case() {
        let manager = RetryManager::new();
        let strategy = fast(5)
            .with_condition(RetryCondition::error_contains("CONNECTION RESET").with_max_retries(0));
        let err = Error::node_execution("upstream: connection reset by peer");

        assert!(manager.should_retry(&strategy, 0, &err, "http").is_none());
        assert!(manager
            .should_retry(&strategy, 0, &Error::node_execution("refused"), "http")
            .is_some());
    }

    #[test]
    fn test_condition_scoped_to_node_types() {
        let manager = RetryManager::new();
        let strategy = fast(5).with_condition(
            RetryCondition::status_codes(&[503])
                .for_node_types(&["http_request"])
                .with_max_retries(0),
        );
        let err = Error::NodeExecution {
            message: "unavailable".into(),
            status_code: Some(503),
        };

        assert!(manager.should_retry(&strategy, 0, &err, "http_request").is_none());
        assert!(manager.should_retry(&strategy, 0, &err, "delay").is_some());
    }

    #[test]
    fn test_cancellation_is_never_retried() {
        let manager = RetryManager::new();
        let strategy = fast(3);
        assert!(manager
            .should_retry(&strategy, 0, &Error::Cancelled("stop".into()), "x")
            .is_none());
        assert!(manager
            .should_retry(&strategy, 0, &Error::CircuitOpen("node_x".into()), "x")
            .is_none());
    }

    #[test]
    fn test_named_strategies_fall_back_to_default() {
        let manager = RetryManager::with_default(fast(1));
        manager.add_strategy("patient", fast(9));

        assert_eq!(manager.strategy("patient").max_retries, 9);
        assert_eq!(manager.strategy("unknown").max_retries, 1);
        assert!(manager.remove_strategy("patient"));
        assert!(!manager.remove_strategy(DEFAULT_STRATEGY));
        assert_eq!(manager.strategy("patient").max_retries, 1);
    }

    #[test]
    fn test_default_strategy_shape() {
        let strategy = RetryStrategy::default();
        assert_eq!(strategy.max_retries, 3);
        assert_eq!(strategy.backoff.backoff_type, BackoffType::Exponential);
        assert_eq!(strategy.conditions.len(), 3);
    }

    // ========================================================================
    // Retry Loop Tests
    // ========================================================================

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_after_failures() {
        let manager = RetryManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let counter = calls.clone();
        let result = manager
            .execute_with_retry(&fast(3), "flaky", &token, move |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(Error::node_execution("transient"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_with_retry_exhausts() {
        let manager = RetryManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let counter = calls.clone();
        let result: Result<()> = manager
            .execute_with_retry(&fast(2), "broken", &token, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::node_execution("permanent"))
                }
            })
            .await;

        match result {
            Err(Error::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("permanent"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_error_is_not_wrapped() {
        let manager = RetryManager::new();
        let token = CancellationToken::new();
        let result: Result<()> = manager
            .execute_with_retry(&RetryStrategy::none(), "x", &token, |_| async {
                Err(Error::node_execution("once"))
            })
            .await;
        assert!(matches!(result, Err(Error::NodeExecution { .. })));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let manager = RetryManager::new();
        let token = CancellationToken::new();
        let strategy = fast(1).with_timeout(Duration::from_millis(20));

        let result = manager
            .execute_with_retry(&strategy, "slow", &token, |attempt| async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(attempt)
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff() {
        let manager = RetryManager::new();
        let token = CancellationToken::new();
        let strategy = RetryStrategy::fixed(5, Duration::from_secs(60));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<()> = manager
            .execute_with_retry(&strategy, "x", &token, |_| async {
                Err(Error::node_execution("fail"))
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
