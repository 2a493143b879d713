use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker states: closed = normal, open = rejecting, half_open = probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit breaker [{name}] is open; retry after {retry_after:?}")]
    Open { name: &'static str, retry_after: Duration },
    #[error(transparent)]
    Inner(#[from] anyhow::Error),
}

impl BreakerError {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

#[derive(Debug, Default, Clone)]
pub struct BreakerStats {
    pub state: &'static str,
    pub failure_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub state_changes: u64,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
    total_rejected: u64,
    state_changes: u64,
}

/// Async circuit breaker wrapping DB and broker operations.
///
/// Opens after `failure_threshold` consecutive failures; half-opens after
/// `recovery_timeout`; closes again after two consecutive half-open successes.
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

const HALF_OPEN_SUCCESSES_TO_CLOSE: u32 = 2;

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                total_requests: 0,
                total_failures: 0,
                total_rejected: 0,
                state_changes: 0,
            }),
        }
    }

    /// Defaults used across the pipeline: 5 failures, 60s recovery.
    pub fn with_defaults(name: &'static str) -> Self {
        Self::new(name, 5, Duration::from_secs(60))
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            state: inner.state.as_str(),
            failure_count: inner.failure_count,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
            state_changes: inner.state_changes,
        }
    }

    /// Execute `op` under the breaker. Rejected immediately with
    /// `BreakerError::Open` while open; otherwise failures count toward
    /// opening and the original error is returned.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.before_call()?;
        match op().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Gate for callers that report success/failure themselves (pollers).
    /// Counts a rejection and errors while open; half-open admits the probe.
    pub fn preflight(&self) -> Result<(), BreakerError> {
        self.before_call()
    }

    fn before_call(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        if inner.state == BreakerState::Open {
            let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.recovery_timeout {
                tracing::info!("[{}] attempting recovery, moving to half_open", self.name);
                inner.state = BreakerState::HalfOpen;
                inner.success_count = 0;
                inner.state_changes += 1;
            } else {
                inner.total_rejected += 1;
                return Err(BreakerError::Open {
                    name: self.name,
                    retry_after: self.recovery_timeout - elapsed,
                });
            }
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= HALF_OPEN_SUCCESSES_TO_CLOSE {
                    tracing::info!("[{}] recovery successful, moving to closed", self.name);
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.state_changes += 1;
                }
            }
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                tracing::warn!("[{}] recovery failed, moving back to open", self.name);
                inner.state = BreakerState::Open;
                inner.failure_count = self.failure_threshold;
                inner.state_changes += 1;
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    tracing::error!(
                        "[{}] failure threshold ({}) reached, opening circuit",
                        self.name,
                        self.failure_threshold
                    );
                    inner.state = BreakerState::Open;
                    inner.state_changes += 1;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        tracing::info!("[{}] circuit breaker manually reset", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", 3, Duration::from_millis(20))
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .call(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await;
    }

    async fn succeed(b: &CircuitBreaker) {
        b.call(|| async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);
        let err = b
            .call(|| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap_err();
        assert!(err.is_open());
        assert_eq!(b.stats().total_rejected, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let b = breaker();
        fail(&b).await;
        fail(&b).await;
        succeed(&b).await;
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_two_successes() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        succeed(&b).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        succeed(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_failure() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        succeed(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }
}
