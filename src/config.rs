use std::time::Duration;

use crate::{EnqueueFailureMode, HandlerFailureMode};

/// Runtime configuration for the [`Spine`](crate::Spine).
///
/// Use the builder methods to customize, or [`Default`] for the standard
/// bounds.
///
/// # Examples
///
/// ```rust
/// use eventspine::{Config, EnqueueFailureMode, HandlerFailureMode};
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_max_steps(500)
///     .with_enqueue_failure_mode(EnqueueFailureMode::Retry)
///     .with_handler_failure_mode(HandlerFailureMode::Store)
///     .with_handler_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on loop iterations in one run. Exceeding it aborts the
    /// run with [`Error::StepBudgetExceeded`](crate::Error::StepBudgetExceeded).
    /// Default: 10 000
    pub max_steps: u64,

    /// Default: [`EnqueueFailureMode::Store`]
    pub enqueue_failure_mode: EnqueueFailureMode,

    /// Default: [`HandlerFailureMode::Log`]
    pub handler_failure_mode: HandlerFailureMode,

    /// Retries after the first failed enqueue in [`EnqueueFailureMode::Retry`].
    /// Default: 3
    pub retry_attempts: u32,

    /// Delay before the first retry; doubles on every further attempt.
    /// Default: 100 ms
    pub retry_base_delay: Duration,

    /// Budget for a single handler invocation. Default: none
    pub handler_timeout: Option<Duration>,

    /// How long one pull waits for an event before the run ends as drained.
    /// Default: 1 s
    pub pull_timeout: Duration,

    /// Consecutive pull failures tolerated before the run aborts with
    /// [`Error::BackendUnavailable`](crate::Error::BackendUnavailable).
    /// Default: 10
    pub max_consecutive_backend_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_steps: 10_000,
            enqueue_failure_mode: EnqueueFailureMode::default(),
            handler_failure_mode: HandlerFailureMode::default(),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            handler_timeout: None,
            pull_timeout: Duration::from_secs(1),
            max_consecutive_backend_failures: 10,
        }
    }
}

impl Config {
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_enqueue_failure_mode(mut self, mode: EnqueueFailureMode) -> Self {
        self.enqueue_failure_mode = mode;
        self
    }

    pub fn with_handler_failure_mode(mut self, mode: HandlerFailureMode) -> Self {
        self.handler_failure_mode = mode;
        self
    }

    /// Set how many times a failed enqueue is retried.
    ///
    /// Only used with [`EnqueueFailureMode::Retry`].
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Treat handler invocations running longer than `timeout` as failures.
    ///
    /// The timed-out future is dropped; it is handled like any other
    /// handler error under the configured [`HandlerFailureMode`].
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Set how long each pull waits.
    ///
    /// A run ends normally the first time a pull returns nothing, so this is
    /// also the idle time after which a drained pipeline stops.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn with_max_consecutive_backend_failures(mut self, limit: u32) -> Self {
        self.max_consecutive_backend_failures = limit;
        self
    }
}
