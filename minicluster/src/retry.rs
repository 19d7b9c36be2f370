//! Bounded retry with exponential backoff.
//!
//! Used uniformly for startup health checks and shutdown confirmation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use parking_lot::Mutex;
use thiserror::Error;

/// The default interval before the first re-check.
const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(50);
/// The default ceiling on the interval between checks.
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(1);

/// The timing parameters of a bounded retry loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The interval before the first re-check.
    pub initial_interval: Duration,
    /// The ceiling on the interval between checks.
    pub max_interval: Duration,
    /// The total time allowed for the condition to be met.
    pub deadline: Duration,
}

impl RetryPolicy {
    /// Create a new policy with the given deadline and default intervals.
    pub fn new(deadline: Duration) -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            deadline,
        }
    }

    /// Override the backoff intervals of this policy.
    pub fn with_intervals(mut self, initial_interval: Duration, max_interval: Duration) -> Self {
        self.initial_interval = initial_interval;
        self.max_interval = max_interval.max(initial_interval);
        self
    }
}

/// The reasons a bounded retry loop may give up.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The deadline elapsed before the condition was met.
    #[error("condition not met within {deadline:?}")]
    DeadlineElapsed {
        deadline: Duration,
        /// The most recent error observed while checking, if any.
        last_error: Option<String>,
    },
    /// The check itself reported that retrying is pointless.
    #[error(transparent)]
    Aborted(anyhow::Error),
}

/// The outcome of a single check within a retry loop.
#[derive(Debug)]
pub enum Check {
    /// The condition is met.
    Ready,
    /// The condition is not met yet, optionally with a diagnostic.
    NotReady(Option<String>),
    /// The condition can never be met, stop retrying.
    Abort(anyhow::Error),
}

/// Repeatedly run `check` with exponential backoff until it reports `Ready`, it aborts, or the
/// policy's deadline elapses.
///
/// The deadline is enforced even when a single check hangs.
pub async fn retry_until<F, Fut>(policy: &RetryPolicy, mut check: F) -> Result<(), RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Check>,
{
    let backoff = ExponentialBackoff {
        current_interval: policy.initial_interval,
        initial_interval: policy.initial_interval,
        max_interval: policy.max_interval,
        max_elapsed_time: Some(policy.deadline),
        ..Default::default()
    };
    // Outlives the backoff future when the deadline cuts it off mid-sleep.
    let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let retries = backoff::future::retry(backoff, || {
        let fut = check();
        let last_error = last_error.clone();
        async move {
            match fut.await {
                Check::Ready => Ok(()),
                Check::NotReady(diag) => {
                    if diag.is_some() {
                        *last_error.lock() = diag;
                    }
                    Err(backoff::Error::Transient(RetryFailure::NotReady))
                }
                Check::Abort(err) => Err(backoff::Error::Permanent(RetryFailure::Aborted(err))),
            }
        }
    });
    let res = tokio::time::timeout(policy.deadline, retries).await;
    let last_error = last_error.lock().take();
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(RetryFailure::Aborted(err))) => Err(RetryError::Aborted(err)),
        Ok(Err(RetryFailure::NotReady)) | Err(_) => Err(RetryError::DeadlineElapsed {
            deadline: policy.deadline,
            last_error,
        }),
    }
}

/// Internal failure type threaded through the backoff loop.
enum RetryFailure {
    NotReady,
    Aborted(anyhow::Error),
}
