//! Bounded retry with proxy rotation
//!
//! Wraps one transport invocation. Transport-class failures rotate the
//! owning account's proxy and retry after a fixed delay, up to the
//! configured attempt ceiling; exhaustion yields `ProxyFailure` as a
//! value. Nothing else is ever retried: a malformed response is
//! converted once and returned. Callers above this layer rely on every
//! failure terminating as a `Result`, never as a panic.

use std::future::Future;
use std::time::Instant;

use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use super::error::ExchangeError;
use crate::config::RetryConfig;

/// Execute `operation`, rotating the proxy via `rotate` between
/// transport-failure attempts.
///
/// `operation` is re-invoked from scratch on each attempt, so signed
/// requests pick up a fresh timestamp and the rotated proxy.
pub async fn with_proxy_rotation<T, F, Fut, R, RFut>(
    config: &RetryConfig,
    instruction: &str,
    mut operation: F,
    mut rotate: R,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
    R: FnMut() -> RFut,
    RFut: Future<Output = ()>,
{
    let mut attempt = 0;
    let started = Instant::now();

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                debug!(
                    "[{}] ok in {:?} ({} attempt(s))",
                    instruction,
                    started.elapsed(),
                    attempt
                );
                return Ok(result);
            }
            Err(err) if err.is_retryable() => {
                warn!(
                    "[Retry] {} attempt {}/{} hit transport failure ({}), rotating proxy",
                    instruction, attempt, config.max_attempts, err
                );
                rotate().await;

                if attempt >= config.max_attempts {
                    return Err(ExchangeError::ProxyFailure {
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                sleep(Duration::from_millis(config.delay_ms)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_rotation() {
        let rotations = Arc::new(AtomicU32::new(0));
        let rotations_clone = rotations.clone();

        let result = with_proxy_rotation(
            &fast_config(),
            "balanceQuery",
            || async { Ok::<_, ExchangeError>(42) },
            || {
                rotations_clone.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(rotations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausts_exactly_the_configured_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let rotations = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let rotations_clone = rotations.clone();

        let result: Result<(), _> = with_proxy_rotation(
            &fast_config(),
            "orderExecute",
            || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(ExchangeError::Transport("connection reset".into())) }
            },
            || {
                rotations_clone.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // Every transport failure rotates, the last one included.
        assert_eq!(rotations.load(Ordering::SeqCst), 2);
        match result.unwrap_err() {
            ExchangeError::ProxyFailure { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected ProxyFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovers_after_rotation() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = with_proxy_rotation(
            &fast_config(),
            "positionQuery",
            || {
                let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ExchangeError::Transport("connection refused".into()))
                    } else {
                        Ok("recovered")
                    }
                }
            },
            || async {},
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transport_errors_fail_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let rotations = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let rotations_clone = rotations.clone();

        let result: Result<(), _> = with_proxy_rotation(
            &fast_config(),
            "withdraw",
            || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(ExchangeError::InvalidJson("<html>".into())) }
            },
            || {
                rotations_clone.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(rotations.load(Ordering::SeqCst), 0);
        assert!(matches!(result.unwrap_err(), ExchangeError::InvalidJson(_)));
    }
}
