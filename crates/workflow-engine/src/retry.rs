//! Bounded retry with exponential backoff
//!
//! Wraps a single step invocation (or any async operation) so callers do
//! not reimplement backoff policy per step. The handler only decides
//! whether to try again once an attempt settles; it never times out or
//! cancels the operation itself.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{Result, WorkflowError};
use crate::registry::StepExecutor;
use crate::types::{Step, StepOutcome};

/// Error substrings retried when no explicit list is configured
pub const DEFAULT_RETRYABLE_ERRORS: [&str; 10] = [
    "timeout",
    "network",
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "rate limit",
    "429",
    "503",
    "502",
    "504",
];

/// Callback invoked before each retry with the attempt index and the error
/// that caused it
pub type RetryCallback<'a> = &'a (dyn Fn(u32, &WorkflowError) + Send + Sync);

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Attempts beyond the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay; doubled for every further retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Delay ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: Option<u64>,
    /// Case-insensitive substrings that make an error retryable; replaces
    /// the default list when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<String>>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> Option<u64> {
    Some(30_000)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            retryable_errors: None,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Lifecycle of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Executing,
    Success,
    Failure,
    WaitingBeforeRetry,
    Aborted,
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::WaitingBeforeRetry => "waiting",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Executes operations under a [`RetryConfig`]
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Replace the policy (between runs)
    pub fn set_config(&mut self, config: RetryConfig) {
        self.config = config;
    }

    /// Delay before the given attempt (1 = first retry)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let delay = self.config.backoff_ms.saturating_mul(factor);
        let delay = match self.config.max_backoff_ms {
            Some(ceiling) => delay.min(ceiling),
            None => delay,
        };
        Duration::from_millis(delay)
    }

    /// Whether an error with this message should be retried
    pub fn is_retryable(&self, message: &str) -> bool {
        let message = message.to_lowercase();

        if message.contains("cancelled") {
            return false;
        }
        if message.contains("validation") || message.contains("invalid") {
            return false;
        }

        match &self.config.retryable_errors {
            Some(patterns) => patterns
                .iter()
                .any(|p| message.contains(&p.to_lowercase())),
            None => DEFAULT_RETRYABLE_ERRORS
                .iter()
                .any(|p| message.contains(&p.to_lowercase())),
        }
    }

    /// Execute a step through its executor, retrying transient failures
    ///
    /// A returned [`StepOutcome::Failure`] is treated like an error return,
    /// so it is classified and retried under the same policy. The step's
    /// `retries` option overrides `max_retries`.
    pub async fn execute_with_retry(
        &self,
        step: &Step,
        context: &ExecutionContext,
        executor: &dyn StepExecutor,
        on_retry: Option<RetryCallback<'_>>,
    ) -> Result<StepOutcome> {
        let max_retries = step.data.retries.unwrap_or(self.config.max_retries);

        self.run(
            &step.id,
            max_retries,
            move || async move {
                match executor.execute(step, context).await? {
                    StepOutcome::Failure { error } => Err(WorkflowError::ExecutionFailed(error)),
                    outcome => Ok(outcome),
                }
            },
            on_retry,
        )
        .await
    }

    /// Execute an arbitrary async operation under the retry policy
    ///
    /// A non-retryable error is returned as is. When every attempt fails
    /// with a retryable error the result is
    /// [`WorkflowError::RetriesExhausted`], whose `source` holds the final
    /// attempt's error unchanged.
    pub async fn execute_function<F, Fut, T>(
        &self,
        operation: F,
        on_retry: Option<RetryCallback<'_>>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run("operation", self.config.max_retries, operation, on_retry)
            .await
    }

    async fn run<F, Fut, T>(
        &self,
        label: &str,
        max_retries: u32,
        mut operation: F,
        on_retry: Option<RetryCallback<'_>>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<WorkflowError> = None;

        for attempt in 0..=max_retries {
            if let Some(previous) = &last_error {
                let delay = self.backoff_delay(attempt);
                if let Some(callback) = on_retry {
                    callback(attempt, previous);
                }
                log::debug!(
                    "{}: {} {:?} before attempt {}/{}",
                    label,
                    AttemptState::WaitingBeforeRetry,
                    delay,
                    attempt + 1,
                    max_retries + 1
                );
                tokio::time::sleep(delay).await;
            }

            log::trace!("{}: attempt {} {}", label, attempt + 1, AttemptState::Executing);
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        log::info!(
                            "{}: {} on attempt {}/{}",
                            label,
                            AttemptState::Success,
                            attempt + 1,
                            max_retries + 1
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let message = err.to_string();
                    if !self.is_retryable(&message) {
                        log::warn!(
                            "{}: {} on non-retryable error: {}",
                            label,
                            AttemptState::Aborted,
                            message
                        );
                        return Err(err);
                    }
                    log::warn!(
                        "{}: attempt {}/{} {}: {}",
                        label,
                        attempt + 1,
                        max_retries + 1,
                        AttemptState::Failure,
                        message
                    );
                    last_error = Some(err);
                }
            }
        }

        let attempts = max_retries.saturating_add(1);
        let source = last_error.unwrap_or_else(|| WorkflowError::failed("no attempt was made"));
        let message = source.to_string();
        log::warn!(
            "{}: {} after {} attempts: {}",
            label,
            AttemptState::Aborted,
            attempts,
            message
        );
        Err(WorkflowError::RetriesExhausted {
            attempts,
            message,
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SyncCallbackStepExecutor;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn handler(max_retries: u32, backoff_ms: u64) -> RetryHandler {
        RetryHandler::new(RetryConfig {
            max_retries,
            backoff_ms,
            max_backoff_ms: None,
            retryable_errors: None,
        })
    }

    #[test]
    fn test_default_classification() {
        let handler = RetryHandler::default();
        for message in [
            "connect ETIMEDOUT 10.0.0.1:443",
            "socket hang up: econnreset",
            "Request Timeout",
            "Network unreachable",
            "HTTP 429 Too Many Requests",
            "upstream returned 503",
            "Rate limit exceeded",
        ] {
            assert!(handler.is_retryable(message), "{} should be retryable", message);
        }
        for message in ["Not found", "HTTP 400", "unexpected token"] {
            assert!(!handler.is_retryable(message), "{} should not be retryable", message);
        }
    }

    #[test]
    fn test_cancellation_and_validation_are_never_retried() {
        let handler = RetryHandler::new(RetryConfig {
            retryable_errors: Some(vec!["cancelled".to_string(), "invalid".to_string()]),
            ..RetryConfig::default()
        });
        assert!(!handler.is_retryable("Run cancelled by user (timeout)"));
        assert!(!handler.is_retryable("validation failed: network missing"));
        assert!(!handler.is_retryable("Invalid API key"));
    }

    #[test]
    fn test_configured_list_overrides_defaults() {
        let handler = RetryHandler::new(RetryConfig {
            retryable_errors: Some(vec!["Quota".to_string()]),
            ..RetryConfig::default()
        });
        assert!(handler.is_retryable("QUOTA exhausted, try later"));
        assert!(!handler.is_retryable("ETIMEDOUT"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut handler = handler(5, 100);
        assert_eq!(handler.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(handler.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(handler.backoff_delay(3), Duration::from_millis(400));

        handler.set_config(RetryConfig {
            max_backoff_ms: Some(250),
            ..handler.config().clone()
        });
        assert_eq!(handler.backoff_delay(3), Duration::from_millis(250));

        handler.set_config(RetryConfig {
            max_backoff_ms: None,
            ..handler.config().clone()
        });
        assert_eq!(handler.backoff_delay(200), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_error_until_success() {
        let handler = handler(2, 100);
        let calls = &AtomicU32::new(0);
        let retries = Mutex::new(Vec::new());
        let on_retry = |attempt: u32, err: &WorkflowError| {
            retries.lock().unwrap().push((attempt, err.to_string()));
        };

        let started = tokio::time::Instant::now();
        let result = handler
            .execute_function(
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(WorkflowError::failed("ETIMEDOUT"))
                    } else {
                        Ok("done")
                    }
                },
                Some(&on_retry),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let retries = retries.lock().unwrap();
        assert_eq!(
            *retries,
            vec![(1, "ETIMEDOUT".to_string()), (2, "ETIMEDOUT".to_string())]
        );
        // 100ms before the first retry, 200ms before the second
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_is_not_retried() {
        let handler = handler(5, 100);
        let calls = &AtomicU32::new(0);
        let retried = AtomicU32::new(0);
        let on_retry = |_: u32, _: &WorkflowError| {
            retried.fetch_add(1, Ordering::SeqCst);
        };

        let result: Result<()> = handler
            .execute_function(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(WorkflowError::failed("validation failed"))
                },
                Some(&on_retry),
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "validation failed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retried.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_last_error() {
        let handler = handler(2, 10);
        let calls = &AtomicU32::new(0);

        let result: Result<()> = handler
            .execute_function(
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err(WorkflowError::failed(format!("HTTP 503 (call {})", n)))
                },
                None,
            )
            .await;

        match result.unwrap_err() {
            WorkflowError::RetriesExhausted {
                attempts,
                message,
                source,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(message, "HTTP 503 (call 2)");
                assert!(matches!(*source, WorkflowError::ExecutionFailed(_)));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_original_error() {
        let handler = handler(1, 10);

        let result: Result<()> = handler
            .execute_function(
                || async {
                    Err(WorkflowError::Timeout {
                        node_id: "fetch".to_string(),
                        timeout_ms: 50,
                    })
                },
                None,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Node 'fetch' timeout after 50ms (after 2 attempts)");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "Node 'fetch' timeout after 50ms");
        match err {
            WorkflowError::RetriesExhausted { source, .. } => assert!(matches!(
                *source,
                WorkflowError::Timeout { timeout_ms: 50, .. }
            )),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_runs_once() {
        let handler = RetryHandler::new(RetryConfig::no_retry());
        let calls = &AtomicU32::new(0);

        let result: Result<()> = handler
            .execute_function(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(WorkflowError::failed("network down"))
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap_err().attempts(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returned_failure_is_retried_like_an_error() {
        let handler = handler(3, 50);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = SyncCallbackStepExecutor::new(move |_step, _ctx| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(StepOutcome::failure("rate limit exceeded"))
            } else {
                Ok(StepOutcome::success(json!({ "ok": true })))
            }
        });
        let step = Step::new("call", "http");

        let outcome = handler
            .execute_with_retry(&step, &ExecutionContext::default(), &executor, None)
            .await
            .unwrap();

        assert_eq!(outcome.output(), Some(&json!({ "ok": true })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_retries_override() {
        let handler = handler(5, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = SyncCallbackStepExecutor::new(move |_step, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(WorkflowError::failed("ECONNREFUSED"))
        });
        let mut step = Step::new("call", "http");
        step.data.retries = Some(1);

        let err = handler
            .execute_with_retry(&step, &ExecutionContext::default(), &executor, None)
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
