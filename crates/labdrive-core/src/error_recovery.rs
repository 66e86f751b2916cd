//! Bounded retry of transport operations.
//!
//! Only *transport*-kind failures are retried. Everything else (domain,
//! protocol, remote, ...) is returned to the caller on the first occurrence.
//! When the attempt budget runs out the last error is wrapped in
//! [`InstrError::Fatal`] together with the operation name.

use crate::error::{InstrError, InstrResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use labdrive_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.attempts(), 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    ///
    /// Values below 1 are treated as 1.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts with 100ms between them.
    ///
    /// ```rust
    /// use labdrive_core::error_recovery::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.max_attempts, 3);
    /// assert_eq!(policy.backoff_delay, Duration::from_millis(100));
    /// ```
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that performs a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Something that can bring itself back to a usable state between attempts.
///
/// Transports implement this by closing and re-opening the connection.
#[async_trait]
pub trait Recoverable: Send + Sync {
    async fn recover(&self) -> InstrResult<()>;
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt budget is exhausted.
///
/// Between attempts the task sleeps for `backoff_delay` and, when given,
/// calls `recoverable.recover()`. A failing recovery is logged and the next
/// attempt proceeds anyway.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    recoverable: Option<&dyn Recoverable>,
    mut op: F,
) -> InstrResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = InstrResult<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= attempts => {
                tracing::error!(
                    target: "labdrive::retry",
                    operation,
                    attempts,
                    error = %err,
                    "retries exhausted"
                );
                return Err(InstrError::Fatal {
                    operation: operation.to_string(),
                    attempts,
                    last: Box::new(err),
                });
            }
            Err(err) => {
                tracing::warn!(
                    target: "labdrive::retry",
                    operation,
                    attempt,
                    error = %err,
                    "transient failure, retrying"
                );
                sleep(policy.backoff_delay).await;
                if let Some(recoverable) = recoverable {
                    if let Err(recover_err) = recoverable.recover().await {
                        tracing::warn!(
                            target: "labdrive::retry",
                            operation,
                            error = %recover_err,
                            "recovery failed"
                        );
                    }
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRecoverable {
        recoveries: AtomicU32,
    }

    #[async_trait]
    impl Recoverable for CountingRecoverable {
        async fn recover(&self) -> InstrResult<()> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let recoverable = CountingRecoverable {
            recoveries: AtomicU32::new(0),
        };
        let hook: &dyn Recoverable = &recoverable;
        let result = with_retry("read", &fast_policy(3), Some(hook), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(InstrError::transport("link dropped"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(recoverable.recoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_fails() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: InstrResult<()> = with_retry("read", &fast_policy(3), None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(InstrError::Timeout(Duration::from_millis(50)))
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            InstrError::Fatal { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, InstrError::Timeout(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_protocol_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: InstrResult<()> = with_retry("query", &fast_policy(5), None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(InstrError::protocol("garbled reply"))
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
