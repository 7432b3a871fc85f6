//! Retry and timeout policy for calls to the signaling store
//!
//! Backoff schedules come from the `backon` crate; this module only decides
//! how many attempts to make and which errors are worth another attempt.

pub mod timeout {
    //! Default timeouts for external calls

    use std::time::Duration;

    /// Default timeout for one HTTP request to the signaling store
    pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

pub mod retry {
    //! Bounded retry with exponential backoff

    use std::fmt::Display;
    use std::future::Future;
    use std::time::Duration;

    use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

    /// How many times, and how far apart, an operation is attempted
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RetryPolicy {
        /// Total attempts including the first one
        pub max_attempts: usize,
        pub min_delay: Duration,
        pub max_delay: Duration,
    }

    impl Default for RetryPolicy {
        fn default() -> Self {
            Self {
                max_attempts: 3,
                min_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
            }
        }
    }

    impl RetryPolicy {
        #[must_use]
        pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
            self.max_attempts = max_attempts.max(1);
            self
        }

        /// Delays between attempts; yields `max_attempts - 1` values
        #[must_use]
        pub fn backoff(&self) -> ExponentialBackoff {
            ExponentialBuilder::default()
                .with_min_delay(self.min_delay)
                .with_max_delay(self.max_delay)
                .with_max_times(self.max_attempts.saturating_sub(1))
                .with_jitter()
                .build()
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// policy runs out of attempts. The last error is returned on exhaustion.
    pub async fn retry<T, E, F, Fut>(
        policy: &RetryPolicy,
        operation: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut delays = policy.backoff();
        let mut attempt: u32 = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) => return Err(e),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(
                            operation,
                            attempt,
                            error = %e,
                            "Transient failure, retrying in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::warn!(operation, attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    }
                },
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Debug, PartialEq)]
        enum TestError {
            Flaky,
            Fatal,
        }

        impl Display for TestError {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{self:?}")
            }
        }

        fn transient(e: &TestError) -> bool {
            *e == TestError::Flaky
        }

        #[tokio::test(start_paused = true)]
        async fn test_retry_recovers_from_transient_errors() {
            let calls = AtomicUsize::new(0);
            let counter = &calls;
            let result = retry(&RetryPolicy::default(), "test", transient, || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok(42)
                }
            })
            .await;

            assert_eq!(result, Ok(42));
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn test_retry_stops_on_fatal_error() {
            let calls = AtomicUsize::new(0);
            let counter = &calls;
            let result: Result<(), _> =
                retry(&RetryPolicy::default(), "test", transient, || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                })
                .await;

            assert_eq!(result, Err(TestError::Fatal));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_retry_is_bounded() {
            let calls = AtomicUsize::new(0);
            let counter = &calls;
            let policy = RetryPolicy::default().with_max_attempts(4);
            let result: Result<(), _> = retry(&policy, "test", transient, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;

            assert_eq!(result, Err(TestError::Flaky));
            assert_eq!(calls.load(Ordering::SeqCst), 4);
        }
    }
}
