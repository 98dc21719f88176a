use crate::error::{LlmError, LlmErrorKind, Result};
use std::future::Future;

/// Bounded re-invocation of a fallible generation call.
///
/// Only errors whose [`LlmErrorKind`] is listed as retryable are retried; anything
/// else propagates on first occurrence. After `max_attempts` the last error is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    retryable: Vec<LlmErrorKind>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retryable: impl IntoIterator<Item = LlmErrorKind>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retryable: retryable.into_iter().collect(),
        }
    }

    /// Retry backend `Response` errors only.
    pub fn response_errors(max_attempts: u32) -> Self {
        Self::new(max_attempts, [LlmErrorKind::Response])
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, error: &LlmError) -> bool {
        self.retryable.contains(&error.kind())
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && self.is_retryable(&error) => {
                    tracing::warn!(
                        %error,
                        attempt,
                        max_attempts = self.max_attempts,
                        "generation attempt failed; retrying"
                    );
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::response_errors(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn response_error(message: &str) -> LlmError {
        LlmError::Response {
            status: 500,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn success_on_second_attempt_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let result = policy
            .run(|attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt == 1 {
                        Err(response_error("first"))
                    } else {
                        Ok(format!("ok on {attempt}"))
                    }
                }
            })
            .await;

        assert_eq!(result.expect("second attempt succeeds"), "ok on 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_response_errors_return_the_last_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let result: Result<String> = policy
            .run(|attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(response_error(&format!("failure {attempt}")))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(LlmError::Response { message, .. }) => assert_eq!(message, "failure 3"),
            other => panic!("expected last response error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn network_and_safety_errors_are_terminal() {
        let policy = RetryPolicy::default();
        for error in [
            LlmError::network("connection reset"),
            LlmError::SafetyBlocked { status: 200 },
        ] {
            let kind = error.kind();
            let calls = Arc::new(AtomicU32::new(0));
            let slot = Arc::new(std::sync::Mutex::new(Some(error)));
            let result: Result<()> = policy
                .run(|_| {
                    let calls = calls.clone();
                    let slot = slot.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let error = slot
                            .lock()
                            .expect("slot lock")
                            .take()
                            .unwrap_or_else(|| LlmError::InvalidInput("retried".to_string()));
                        Err(error)
                    }
                })
                .await;
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{kind:?} must not retry");
            assert_eq!(result.expect_err("error propagates").kind(), kind);
        }
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::response_errors(0).max_attempts(), 1);
    }
}
