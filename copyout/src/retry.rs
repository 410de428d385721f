use crate::{CopyOutError, ErrorKind, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// When and how often to try an operation again after it fails.
///
/// Policies are plain data attached to workflow states; [`RetryPolicy::retry`] applies one to an
/// async operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Only errors of these kinds are retried.  Anything else fails immediately.
    pub errors: Vec<ErrorKind>,

    /// Delay before the first retry
    pub interval: Duration,

    /// Double the delay after each retry instead of keeping it fixed
    pub exponential: bool,

    /// How many times the operation is run again after the first attempt fails.  0 means never.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Retry errors of `kind` at a fixed interval
    pub fn fixed(kind: ErrorKind, interval: Duration, max_retries: u32) -> Self {
        Self {
            errors: vec![kind],
            interval,
            exponential: false,
            max_retries,
        }
    }

    /// A policy that retries nothing
    pub fn never() -> Self {
        Self {
            errors: Vec::new(),
            interval: Duration::ZERO,
            exponential: false,
            max_retries: 0,
        }
    }

    pub fn handles(&self, kind: ErrorKind) -> bool {
        self.errors.contains(&kind)
    }

    /// The delay after failed attempt number `attempt` (starting at 1) before the next one
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        if self.exponential {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.interval.saturating_mul(factor)
        } else {
            self.interval
        }
    }

    fn backoff(&self) -> again::RetryPolicy {
        let policy = if self.exponential {
            again::RetryPolicy::exponential(self.interval)
        } else {
            again::RetryPolicy::fixed(self.interval)
        };

        policy.with_max_retries(self.max_retries as usize)
    }

    /// Run `operation` until it succeeds, fails with an error this policy doesn't handle, or the
    /// retries are used up.
    ///
    /// `operation` is passed the number of the attempt, starting at 1.  The error of the last
    /// attempt is returned if none succeeds.
    pub async fn retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        let result = self
            .backoff()
            .retry_if(
                || {
                    attempt += 1;
                    if attempt > 1 {
                        debug!(attempt, "Retrying after recoverable error");
                    }
                    operation(attempt)
                },
                |e: &CopyOutError| self.handles(e.kind()),
            )
            .await;

        match &result {
            Ok(_) if attempt > 1 => debug!(attempt, "Operation succeeded after retrying"),
            Err(e) if self.handles(e.kind()) => {
                warn!(attempt, err = %e, "Giving up after exhausting retries")
            }
            _ => {}
        }

        result
    }
}
