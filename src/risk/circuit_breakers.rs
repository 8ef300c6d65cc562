use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::BoxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds for one guarded dependency
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures (while closed) before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// How long the breaker stays open after the last failure
    pub timeout: Duration,
    /// Calls running longer than this count as failures
    pub call_timeout: Option<Duration>,
    /// Trial calls allowed in flight while half-open
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            call_timeout: None,
            half_open_max_calls: 1,
        }
    }
}

/// Outcome of a guarded call that did not produce a value.
///
/// `Open` means the operation was never invoked.
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit breaker '{breaker}' is open")]
    Open { breaker: String },
    #[error("call through '{breaker}' timed out after {limit:?}")]
    Timeout { breaker: String, limit: Duration },
    #[error("call through '{breaker}' failed: {source}")]
    Dependency {
        breaker: String,
        #[source]
        source: BoxError,
    },
}

impl BreakerError {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Point-in-time view of a breaker for health dashboards
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change_at: DateTime<Utc>,
    pub is_healthy: bool,
    pub forced_open: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    trials_in_flight: u32,
    forced_open: bool,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change_at: DateTime<Utc>,
}

/// Circuit breaker guarding calls to one flaky dependency.
///
/// Counters live behind a mutex that is never held across the guarded call,
/// so the same breaker can be shared freely between tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                trials_in_flight: 0,
                forced_open: false,
                last_failure: None,
                last_failure_at: None,
                last_state_change_at: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejects with [`BreakerError::Open`] without calling `operation` while
    /// the breaker is open and its cooldown has not elapsed.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let permit = self.acquire()?;

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result.map_err(|source| BreakerError::Dependency {
                    breaker: self.name.clone(),
                    source,
                }),
                Err(_) => Err(BreakerError::Timeout {
                    breaker: self.name.clone(),
                    limit,
                }),
            },
            None => operation().await.map_err(|source| BreakerError::Dependency {
                breaker: self.name.clone(),
                source,
            }),
        };

        match &outcome {
            Ok(_) => permit.success(),
            Err(e) => {
                tracing::debug!(breaker = %self.name, error = %e, "Guarded call failed");
                permit.failure();
            }
        }

        outcome
    }

    /// Current state, applying no transitions
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            last_state_change_at: inner.last_state_change_at,
            is_healthy: inner.state == CircuitState::Closed,
            forced_open: inner.forced_open,
        }
    }

    /// Operator halt. Stays open until [`force_close`](Self::force_close);
    /// the cooldown trial does not apply.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.forced_open = true;
        inner.success_count = 0;
        self.transition(&mut inner, CircuitState::Open, "forced open by operator");
    }

    /// Operator recovery. Clears counters and the forced flag.
    pub fn force_close(&self) {
        let mut inner = self.lock();
        inner.forced_open = false;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.trials_in_flight = 0;
        self.transition(&mut inner, CircuitState::Closed, "forced closed by operator");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<Permit<'_>, BreakerError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let cooled_down = !inner.forced_open
                    && inner
                        .last_failure
                        .map_or(true, |at| at.elapsed() >= self.config.timeout);

                if cooled_down {
                    inner.success_count = 0;
                    inner.trials_in_flight = 1;
                    self.transition(&mut inner, CircuitState::HalfOpen, "cooldown elapsed");
                    Ok(Permit::new(self, true))
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.config.half_open_max_calls {
                    inner.trials_in_flight += 1;
                    Ok(Permit::new(self, true))
                } else {
                    Err(self.open_error())
                }
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    self.transition(&mut inner, CircuitState::Closed, "recovered");
                }
            }
            // Late result from a call admitted before the state changed
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                inner.last_failure_at = Some(Utc::now());
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, "failure threshold reached");
                }
            }
            CircuitState::HalfOpen => {
                // No partial credit
                inner.failure_count += 1;
                inner.success_count = 0;
                inner.last_failure = Some(Instant::now());
                inner.last_failure_at = Some(Utc::now());
                self.transition(&mut inner, CircuitState::Open, "trial call failed");
            }
            CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, cause: &str) {
        let from = inner.state;
        let at = Utc::now();
        inner.state = to;
        inner.last_state_change_at = at;

        if to == CircuitState::Open {
            tracing::warn!(
                breaker = %self.name,
                from = ?from,
                to = ?to,
                at = %at,
                failures = inner.failure_count,
                cause,
                "Circuit breaker opened"
            );
        } else {
            tracing::info!(
                breaker = %self.name,
                from = ?from,
                to = ?to,
                at = %at,
                cause,
                "Circuit breaker state changed"
            );
        }
    }

    fn open_error(&self) -> BreakerError {
        BreakerError::Open {
            breaker: self.name.clone(),
        }
    }
}

/// Admission for one guarded call. A permit dropped without an outcome
/// (the caller's future was cancelled) hands its trial slot back.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fail() -> crate::Result<u32> {
        Err("dependency down".into())
    }

    async fn succeed() -> crate::Result<u32> {
        Ok(42)
    }

    fn breaker(failure_threshold: u32, success_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold,
                success_threshold,
                timeout: Duration::from_millis(timeout_ms),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_closed_passes_calls_through() {
        let cb = breaker(3, 1, 30_000);

        let value = cb.execute(succeed).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.status().is_healthy);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1, 30_000);

        let _ = cb.execute(fail).await;
        let _ = cb.execute(fail).await;
        assert_eq!(cb.status().failure_count, 2);

        cb.execute(succeed).await.unwrap();
        assert_eq!(cb.status().failure_count, 0);

        // Two more failures are not enough to trip after the reset
        let _ = cb.execute(fail).await;
        let _ = cb.execute(fail).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking_operation() {
        let cb = breaker(3, 1, 30_000);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result = cb
                .execute(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    fail()
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Dependency { .. })));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                succeed()
            })
            .await;
        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(3, 1, 30_000);
        for _ in 0..3 {
            let _ = cb.execute(fail).await;
        }

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(cb.execute(succeed).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_millis(1)).await;
        let result = cb.execute(fail).await;
        assert!(matches!(result, Err(BreakerError::Dependency { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().success_count, 0);

        // Cooldown restarts from the failed trial call
        assert!(cb.execute(succeed).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = breaker(2, 2, 1_000);
        let _ = cb.execute(fail).await;
        let _ = cb.execute(fail).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;

        cb.execute(succeed).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.status().success_count, 1);

        cb.execute(succeed).await.unwrap();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker(1, 1, 1_000);
        let _ = cb.execute(fail).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = cb.execute(|| async move {
            let _ = release_rx.await;
            Ok::<u32, BoxError>(1)
        });
        tokio::pin!(trial);

        // Drive the trial until it parks on the channel
        assert!(futures_poll_once(trial.as_mut()).await.is_none());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // A second caller is turned away while the trial is in flight
        assert!(cb.execute(succeed).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            "slow",
            BreakerConfig {
                failure_threshold: 1,
                call_timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<u32, BoxError>(1)
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_ignores_cooldown_until_force_close() {
        let cb = breaker(3, 1, 1_000);

        cb.force_open();
        assert!(cb.status().forced_open);
        assert!(!cb.status().is_healthy);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.execute(succeed).await.unwrap_err().is_open());

        cb.force_close();
        assert_eq!(cb.execute(succeed).await.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.status().forced_open);
    }

    #[tokio::test]
    async fn test_status_records_failure_time() {
        let cb = breaker(3, 1, 30_000);
        assert!(cb.status().last_failure_at.is_none());

        let _ = cb.execute(fail).await;
        let status = cb.status();
        assert!(status.last_failure_at.is_some());
        assert_eq!(status.name, "test");
    }

    /// Poll a future exactly once, yielding its output if it completed.
    async fn futures_poll_once<F: Future + Unpin>(fut: F) -> Option<F::Output> {
        let mut fut = fut;
        std::future::poll_fn(|cx| {
            use std::task::Poll;
            match std::pin::Pin::new(&mut fut).poll(cx) {
                Poll::Ready(out) => Poll::Ready(Some(out)),
                Poll::Pending => Poll::Ready(None),
            }
        })
        .await
    }
}
