//! Deadline enforcement for a single call.
//!
//! The call runs on its own thread and hands its result back through a
//! one-slot channel. On expiry the caller stops listening, so a late result
//! lands in a dropped channel and is discarded: exactly one outcome is ever
//! delivered. Cancellation is cooperative through [`CancellationToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::TimeLimiterConfig;
use crate::error::{ConfigError, FailureKind, GuardError, Outcome};
use crate::metrics::{MetricSink, NullMetricSink};

/// Shared flag a running call polls to learn that its caller gave up.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Runs calls with a hard wall-clock deadline.
pub struct TimeLimiter {
    name: String,
    config: TimeLimiterConfig,
    metric_sink: Arc<dyn MetricSink>,
}

impl TimeLimiter {
    /// Creates a time limiter after validating `config`.
    pub fn new(name: impl Into<String>, config: TimeLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            metric_sink: Arc::new(NullMetricSink),
        })
    }

    /// Sends timeouts to `sink`.
    pub fn with_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured deadline.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Runs `work` with the configured deadline.
    pub fn run<F, T, E>(&self, work: F) -> Outcome<T, E>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.run_with_deadline(work, self.config.timeout)
    }

    /// Runs `work` and waits at most `timeout` for it.
    ///
    /// A panic inside `work` is resumed on the calling thread if it happens
    /// before the deadline.
    pub fn run_with_deadline<F, T, E>(&self, work: F, timeout: Duration) -> Outcome<T, E>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let (tx, rx) = mpsc::sync_channel(1);

        let spawned = thread::Builder::new()
            .name(format!("{}-call", self.name))
            .spawn(move || {
                let result = work(&task_token);
                // The receiver is gone once the caller timed out.
                let _ = tx.send(result);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                error!(time_limiter = %self.name, error = %err, "failed to start call");
                return Err(self.expire(&token, timeout));
            }
        };

        match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(GuardError::Upstream),
            Err(RecvTimeoutError::Timeout) => Err(self.expire(&token, timeout)),
            Err(RecvTimeoutError::Disconnected) => match handle.join() {
                Err(panic) => std::panic::resume_unwind(panic),
                Ok(()) => Err(self.expire(&token, timeout)),
            },
        }
    }

    fn expire<E>(&self, token: &CancellationToken, timeout: Duration) -> GuardError<E> {
        if self.config.cancel_running {
            token.cancel();
        }
        warn!(time_limiter = %self.name, timeout = ?timeout, "call timed out");
        self.metric_sink
            .record_rejection(&self.name, FailureKind::TimedOut);
        GuardError::TimedOut
    }
}

#[cfg(feature = "async")]
impl TimeLimiter {
    /// Runs the future produced by `work` on the tokio runtime with the
    /// configured deadline, aborting the task on expiry when
    /// `cancel_running` is set.
    pub async fn run_async<F, Fut, T, E>(&self, work: F) -> Outcome<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        use futures::future::{select, Either};

        let token = CancellationToken::new();
        let handle = tokio::spawn(work(token.clone()));
        let timer = Box::pin(tokio::time::sleep(self.config.timeout));

        match select(handle, timer).await {
            Either::Left((Ok(result), _)) => result.map_err(GuardError::Upstream),
            Either::Left((Err(err), _)) if err.is_panic() => {
                std::panic::resume_unwind(err.into_panic())
            }
            Either::Left((Err(_), _)) => Err(self.expire(&token, self.config.timeout)),
            Either::Right((_, handle)) => {
                if self.config.cancel_running {
                    handle.abort();
                }
                Err(self.expire(&token, self.config.timeout))
            }
        }
    }
}

impl std::fmt::Debug for TimeLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}
