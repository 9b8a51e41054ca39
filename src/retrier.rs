// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Bounded Retry
//!
//! This module provides the retry combinator shared by the publish path and
//! the reconnect loop: run an operation up to a fixed number of attempts with
//! a fixed delay between them, returning the first success or the last error.

use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tracing::warn;

/// Runs `operation` up to `attempts` times, sleeping `delay` between
/// attempts.
///
/// # Parameters
/// * `attempts` - Total number of tries; values below 1 are treated as 1
/// * `delay` - Fixed pause between failed attempts
/// * `operation` - The fallible operation to run
///
/// # Returns
/// The first success, or the final error once the budget is exhausted
pub async fn retry_with_attempts<T, E, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut operation: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut left_attempts = attempts.max(1);

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                left_attempts -= 1;
                if left_attempts == 0 {
                    return Err(err);
                }

                warn!(
                    error = err.to_string(),
                    left_attempts, "operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_result_on_first_try() {
        let result: Result<&str, String> =
            retry_with_attempts(3, Duration::ZERO, || async { Ok("success") }).await;

        assert_eq!(result, Ok("success"));
    }

    #[tokio::test]
    async fn retries_and_succeeds() {
        let count = AtomicU32::new(0);

        let result: Result<&str, String> = retry_with_attempts(3, Duration::ZERO, || {
            let attempt = count.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err("fail".to_owned())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn propagates_the_final_error_after_max_tries() {
        let count = AtomicU32::new(0);

        let result: Result<(), String> = retry_with_attempts(3, Duration::ZERO, || {
            count.fetch_add(1, Ordering::SeqCst);
            async { Err("fail".to_owned()) }
        })
        .await;

        assert_eq!(result, Err("fail".to_owned()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
