//! Bounded-concurrency retry wrapper around a remote call.
//!
//! A [`RetryController`] gates every attempt behind a process-wide
//! semaphore (so only so many remote calls are ever in flight at once),
//! retries a caller-classified "retryable" failure with exponential
//! backoff, and honours cooperative cancellation between attempts and
//! during backoff sleeps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// How a single attempt's failure should be treated.
#[derive(Debug, Clone)]
pub enum Attempt<E> {
    /// Worth another try, subject to the remaining attempt budget.
    Retryable(E),
    /// No point retrying; surfaced immediately.
    Terminal(E),
}

/// The result of running a call through the controller to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T, E> {
    Success(T),
    Failed(E),
    /// The cancellation token fired before a result was available.
    Aborted,
}

/// Exponential backoff with additive jitter: `2^(k-1) + 0.1*k` seconds
/// after a failed attempt `k` (1-indexed).
fn backoff_duration(attempt: u32) -> Duration {
    let seconds = 2f64.powi(attempt as i32 - 1) + 0.1 * attempt as f64;
    Duration::from_secs_f64(seconds)
}

pub struct RetryController {
    semaphore: Arc<Semaphore>,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl RetryController {
    pub fn new(max_concurrent: usize, max_attempts: u32, cancel: CancellationToken) -> RetryController {
        RetryController {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_attempts: max_attempts.max(1),
            cancel,
        }
    }

    /// Runs `f` up to `max_attempts` times. Each invocation acquires a
    /// semaphore permit for its duration; the permit is released as soon as
    /// the attempt's future resolves, win or lose.
    pub async fn call<T, E, F, Fut>(&self, mut f: F) -> Outcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt<E>>>,
    {
        let mut last_error: Option<E> = None;

        for attempt in 1..=self.max_attempts {
            if self.cancel.is_cancelled() {
                return Outcome::Aborted;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Aborted,
                permit = self.semaphore.acquire() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(_) => return Outcome::Aborted,
            };

            let result = f().await;
            drop(permit);

            match result {
                Ok(value) => return Outcome::Success(value),
                Err(Attempt::Terminal(err)) => return Outcome::Failed(err),
                Err(Attempt::Retryable(err)) => {
                    log::warn!("attempt {attempt}/{} failed, retrying", self.max_attempts);
                    last_error = Some(err);
                    if attempt == self.max_attempts {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Outcome::Aborted,
                        _ = tokio::time::sleep(backoff_duration(attempt)) => {}
                    }
                }
            }
        }

        Outcome::Failed(last_error.expect("at least one retryable attempt ran"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_matches_the_documented_formula() {
        assert_eq!(backoff_duration(1), Duration::from_secs_f64(1.1));
        assert_eq!(backoff_duration(2), Duration::from_secs_f64(2.2));
        assert_eq!(backoff_duration(3), Duration::from_secs_f64(4.3));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let controller = RetryController::new(2, 4, CancellationToken::new());
        let calls = AtomicU32::new(0);
        let outcome = controller
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Attempt::Retryable("transient"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(outcome, Outcome::Success(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let controller = RetryController::new(2, 3, CancellationToken::new());
        let calls = AtomicU32::new(0);
        let outcome: Outcome<(), &str> = controller
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Attempt::Retryable("down")) }
            })
            .await;
        assert_eq!(outcome, Outcome::Failed("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_skips_remaining_attempts() {
        let controller = RetryController::new(2, 4, CancellationToken::new());
        let calls = AtomicU32::new(0);
        let outcome: Outcome<(), &str> = controller
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Attempt::Terminal("not found")) }
            })
            .await;
        assert_eq!(outcome, Outcome::Failed("not found"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let controller = RetryController::new(2, 4, cancel);
        let outcome: Outcome<(), &str> =
            controller.call(|| async { Ok(()) }).await;
        assert_eq!(outcome, Outcome::Aborted);
    }
}
