//! Bounded retry of statements that hit transient errors.

use std::future::Future;
use std::time::Duration;

use cidb_config::RetrySettings;
use tracing::{info, warn};

/// How often and how patiently a statement is retried.
///
/// The delay before retry `n` (1-based) is `initial_delay * backoff_factor^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            backoff_factor,
        }
    }

    /// A policy that fails on the first error.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, 1.0)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.backoff_factor.powi(retry.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(exp)
    }

    /// Run `op` until it succeeds, fails with an error `is_transient` rejects,
    /// or the retry budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if retries > 0 {
                        info!(operation, retries, "cidb query succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if retries < self.max_retries && is_transient(&e) => {
                    retries += 1;
                    let delay = self.delay_for(retries);
                    warn!(
                        operation,
                        retry = retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying cidb query after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self::new(
            settings.max_retries,
            settings.initial_delay,
            settings.backoff_factor,
        )
    }
}

/// Connection resets, deadlocks, lock timeouts and server restarts.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        _ => false,
    }
}

pub fn is_transient_sqlstate(code: &str) -> bool {
    // Class 08 is "connection exception".
    code.starts_with("08")
        || matches!(
            code,
            "40001" // serialization_failure
                | "40P01" // deadlock_detected
                | "55P03" // lock_not_available
                | "57P01" // admin_shutdown
                | "57P02" // crash_shutdown
                | "57P03" // cannot_connect_now
                | "53300" // too_many_connections
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Reset,
        Syntax,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn transient(e: &FakeError) -> bool {
        *e == FakeError::Reset
    }

    fn instant(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::ZERO, 2.0)
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = instant(4)
            .run("insert", transient, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FakeError::Reset)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant(4)
            .run("insert", transient, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Syntax) }
            })
            .await;

        assert_eq!(result, Err(FakeError::Syntax));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant(3)
            .run("update", transient, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Reset) }
            })
            .await;

        assert_eq!(result, Err(FakeError::Reset));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy::new(8, Duration::from_secs(4), 2.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(32));
    }

    #[test]
    fn test_transient_sqlstates() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("55P03"));
        assert!(!is_transient_sqlstate("23503"));
        assert!(!is_transient_sqlstate("42601"));
    }

    #[test]
    fn test_sqlx_error_classification() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(is_transient(&sqlx::Error::Io(reset)));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }
}
