//! Retry with backoff for calls to flaky collaborators (engine, database).

use std::time::Duration;

use tracing::*;

/// Default number of retries for execution engine calls.
pub const DEFAULT_ENGINE_CALL_MAX_RETRIES: u16 = 5;

/// Default number of retries for database operations.
pub const DEFAULT_DB_CALL_MAX_RETRIES: u16 = 3;

/// Backoff schedule for retried operations.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    multiplier: u32,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, multiplier: u32, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay before retry attempt `attempt` (starting from 0).
    pub fn delay_for(&self, attempt: u16) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..attempt {
            delay = (delay * self.multiplier).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 2,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Calls `op` until it succeeds or `max_retries` additional attempts have
/// been exhausted, sleeping per the backoff policy between attempts.
/// Blocking variant, for use from sync workers.
pub fn retry_with_backoff<T, E: std::fmt::Display>(
    name: &str,
    max_retries: u16,
    policy: &ExponentialBackoff,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(%name, %attempt, %e, ?delay, "operation failed, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                error!(%name, %attempt, %e, "operation failed, retries exhausted");
                return Err(e);
            }
        }
    }
}

/// Async variant of [`retry_with_backoff`].
pub async fn retry_with_backoff_async<T, E, F, Fut>(
    name: &str,
    max_retries: u16,
    policy: &ExponentialBackoff,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(%name, %attempt, %e, ?delay, "operation failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(%name, %attempt, %e, "operation failed, retries exhausted");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("nope")]
    struct Nope;

    #[test]
    fn test_backoff_schedule() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), 2, Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_eventually_succeeds() {
        let calls = Cell::new(0);
        let policy = ExponentialBackoff::new(Duration::from_millis(1), 1, Duration::from_millis(1));
        let res: Result<u32, Nope> = retry_with_backoff("test_op", 5, &policy, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Nope)
            } else {
                Ok(7)
            }
        });
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_exhausts() {
        let calls = Cell::new(0);
        let policy = ExponentialBackoff::new(Duration::from_millis(1), 1, Duration::from_millis(1));
        let res: Result<u32, Nope> = retry_with_backoff("test_op", 2, &policy, || {
            calls.set(calls.get() + 1);
            Err(Nope)
        });
        assert!(res.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_async() {
        let calls = Cell::new(0);
        let policy = ExponentialBackoff::new(Duration::from_millis(1), 1, Duration::from_millis(1));
        let res: Result<u32, Nope> = retry_with_backoff_async("test_op", 5, &policy, || {
            calls.set(calls.get() + 1);
            let ok = calls.get() >= 2;
            async move { if ok { Ok(1) } else { Err(Nope) } }
        })
        .await;
        assert_eq!(res.unwrap(), 1);
    }
}
