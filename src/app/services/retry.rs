// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded retry with exponential backoff. Classification lives on the error
//! itself: only errors marked retryable are re-attempted, everything else
//! returns after the first try.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::app::errors::{AppError, AppResult};
use crate::app::types::RetryPolicy;

/// Run `op` up to `policy.max_attempts` times. The closure receives the
/// zero-based attempt number. Cancellation is honored between attempts and
/// during backoff sleeps, never mid-attempt.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &watch::Receiver<bool>,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err: Option<AppError> = None;

    for attempt in 0..attempts {
        if *cancel.borrow() {
            return Err(AppError::cancelled());
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() => {
                tracing::debug!(attempt, error = %err, "attempt failed, will retry");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
        if attempt + 1 < attempts {
            let delay = backoff_delay(policy, attempt);
            let mut cancel = cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = cancel.changed() => {
                    if changed.is_ok() && *cancel.borrow() {
                        return Err(AppError::cancelled());
                    }
                }
            }
        }
    }

    match last_err {
        Some(err) => Err(err.exhausted_after(attempts)),
        None => Err(AppError::internal("retry loop ran zero attempts")),
    }
}

/// `min(max_delay, base * 2^attempt)` with uniform ± jitter.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay.as_secs_f64() * 2f64.powi(attempt.min(31) as i32);
    let capped = base.min(policy.max_delay.as_secs_f64());
    let jitter_span = capped * policy.jitter_ratio.clamp(0.0, 1.0);
    let jitter = if jitter_span > 0.0 {
        rand::rng().random_range(-jitter_span..=jitter_span)
    } else {
        0.0
    };
    Duration::from_secs_f64((capped + jitter).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_ratio: 0.0,
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let out = execute(&fast_policy(3), &no_cancel(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, AppError>(42) }
        })
        .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: AppResult<()> = execute(&fast_policy(3), &no_cancel(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::validation("bad input")) }
        })
        .await;
        let err = out.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!err.retries_exhausted());
    }

    #[tokio::test]
    async fn retryable_errors_exhaust_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let out: AppResult<()> = execute(&fast_policy(3), &no_cancel(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::network("unreachable")) }
        })
        .await;
        let err = out.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.retries_exhausted());
        assert!(err.message().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_succeeds() {
        let calls = AtomicU32::new(0);
        let out = execute(&fast_policy(5), &no_cancel(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(AppError::network("flaky"))
                } else {
                    Ok("up")
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_wins_over_further_attempts() {
        let (tx, rx) = watch::channel(true);
        let calls = AtomicU32::new(0);
        let out: AppResult<()> = execute(&fast_policy(3), &rx, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::network("unreachable")) }
        })
        .await;
        drop(tx);
        assert_eq!(out.unwrap_err().kind(), crate::app::errors::AppErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff_sleep() {
        let (tx, rx) = watch::channel(false);
        let slow = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.0,
        };
        let handle = tokio::spawn(async move {
            execute(&slow, &rx, |_| async {
                Err::<(), _>(AppError::network("down"))
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let out = handle.await.unwrap();
        assert_eq!(
            out.unwrap_err().kind(),
            crate::app::errors::AppErrorKind::Cancelled
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            jitter_ratio: 0.0,
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_the_configured_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.2,
        };
        for _ in 0..100 {
            let d = backoff_delay(&policy, 0).as_secs_f64();
            assert!((8.0..=12.0).contains(&d), "delay {d} outside jitter band");
        }
    }
}
