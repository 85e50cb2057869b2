use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: usize },
    /// The error stayed retryable until its attempt budget ran out
    Exhausted { error: E, attempts: usize },
    /// The error was not retryable
    Failed { error: E, attempts: usize },
    Cancelled { attempts: usize },
}

/// Fixed-delay retries whose sleeps end early on shutdown
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Sleep one delay. Returns false when shutdown was requested first.
    pub async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.delay) => true,
        }
    }

    /// Call `op` until it succeeds. `budget` gives the total attempts allowed
    /// for a given error; zero means the error is not retryable.
    pub async fn run<T, E, B, F, Fut>(
        &self,
        label: &str,
        shutdown: &CancellationToken,
        budget: B,
        mut op: F,
    ) -> RetryOutcome<T, E>
    where
        E: Display,
        B: Fn(&E) -> usize,
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            if shutdown.is_cancelled() {
                return RetryOutcome::Cancelled { attempts: attempt };
            }
            attempt += 1;

            let error = match op(attempt).await {
                Ok(value) => return RetryOutcome::Succeeded { value, attempts: attempt },
                Err(error) => error,
            };

            let allowed = budget(&error);
            if allowed == 0 {
                return RetryOutcome::Failed { error, attempts: attempt };
            }
            if attempt >= allowed {
                return RetryOutcome::Exhausted { error, attempts: attempt };
            }

            warn!(
                "{} attempt {}/{} failed: {}; retrying in {:?}",
                label, attempt, allowed, error, self.delay
            );
            if !self.pause(shutdown).await {
                return RetryOutcome::Cancelled { attempts: attempt };
            }
        }
    }
}
