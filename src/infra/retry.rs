use std::time::Duration;

use crate::infra::shutdown::Shutdown;

/// Backoff parameters. `max_retries == -1` retries forever (startup
/// connections wait for their dependency to come up).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn infinite() -> Self {
        Self { max_retries: -1, ..Self::default() }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.exponential_base.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// True when the error chain bottoms out in a transport problem worth
/// retrying: connection refused/reset, DNS failure, socket timeout, broker
/// connection/channel errors, OS-level I/O errors. Anything else is a bug or
/// a permanent condition and is surfaced immediately.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        if let Some(e) = cause.downcast_ref::<tokio_postgres::Error>() {
            if e.is_closed() || e.as_db_error().is_none() {
                return true;
            }
        }
        if let Some(e) = cause.downcast_ref::<lapin::Error>() {
            use lapin::Error as L;
            if matches!(e, L::IOError(_) | L::ProtocolError(_) | L::InvalidConnectionState(_) | L::InvalidChannelState(_)) {
                return true;
            }
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                return true;
            }
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        if cause.downcast_ref::<deadpool_postgres::PoolError>().is_some() {
            return true;
        }
    }
    false
}

/// Retry `op` with exponential backoff on transient errors. Sleeps are
/// polled against the shutdown signal every 100ms so a stop request is not
/// stuck behind a long backoff.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    name: &str,
    shutdown: &Shutdown,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_shutdown() {
            anyhow::bail!("{name}: shutdown requested, aborting retries");
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                attempt += 1;
                if policy.max_retries >= 0 && attempt > policy.max_retries as u32 {
                    tracing::error!("{name}: all {} attempts failed: {e:#}", attempt);
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt);
                let level_info = attempt <= 3;
                if level_info {
                    tracing::info!("{name}: attempt {attempt} failed ({e}); retrying in {delay:?}");
                } else {
                    tracing::warn!("{name}: attempt {attempt} failed ({e}); retrying in {delay:?}");
                }
                if interruptible_sleep(shutdown, delay).await {
                    anyhow::bail!("{name}: shutdown requested during retry backoff");
                }
            }
            Err(e) => {
                tracing::error!("{name}: non-transient error (not retrying): {e:#}");
                return Err(e);
            }
        }
    }
}

/// Sleep in 100ms slices, returning true if shutdown fired.
async fn interruptible_sleep(shutdown: &Shutdown, total: Duration) -> bool {
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.is_shutdown() {
            return true;
        }
        let step = Duration::from_millis(100).min(total - slept);
        tokio::time::sleep(step).await;
        slept += step;
    }
    shutdown.is_shutdown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::shutdown;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn io_errors_are_transient() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(is_transient(&err));
    }

    #[test]
    fn plain_errors_are_not_transient() {
        let err = anyhow::anyhow!("arithmetic bug");
        assert!(!is_transient(&err));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let (_handle, sd) = shutdown::channel();
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&policy, "test", &sd, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::Error::new(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timeout",
                    )))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_immediately() {
        let (_handle, sd) = shutdown::channel();
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_with_backoff(&policy, "test", &sd, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("logic error")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
