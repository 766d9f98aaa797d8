use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AbortCause, Error, FailureCategory};

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum RetryDecision {
    /// Retry on the host that just failed.
    RetrySame,
    /// Retry on the next host of the query plan.
    RetryNext,
    /// Give up and surface the error.
    Rethrow,
}

/// Which host an attempt should go to. The first attempt is always
/// `Initial`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum RetryTarget {
    Initial,
    SameHost,
    NextHost,
}

/// Bounded retries without backoff. `attempt` counts the retries already
/// made for one logical request, so the first failure is seen with
/// `attempt == 0`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn on_error(&self, error: &Error, attempt: u32) -> RetryDecision {
        let budget_left = attempt < self.max_retries;
        match error.category() {
            FailureCategory::ReadTimeout | FailureCategory::WriteTimeout if budget_left => {
                RetryDecision::RetrySame
            }
            FailureCategory::Unavailable | FailureCategory::Coordinator if budget_left => {
                RetryDecision::RetryNext
            }
            FailureCategory::Aborted(AbortCause::ConnectionClosed | AbortCause::HeartbeatFailed)
                if budget_left =>
            {
                RetryDecision::RetryNext
            }
            FailureCategory::ReadTimeout
            | FailureCategory::WriteTimeout
            | FailureCategory::Unavailable
            | FailureCategory::Coordinator
            | FailureCategory::Aborted(_)
            | FailureCategory::ServerFailure
            | FailureCategory::ClientSide
            | FailureCategory::Cancelled => RetryDecision::Rethrow,
        }
    }

    /// Runs `request` until it succeeds or the policy gives up. Cancellation
    /// of `token` interrupts a pending attempt and is never retried.
    pub async fn run<T, F, Fut>(&self, token: &CancellationToken, mut request: F) -> Result<T, Error>
    where
        F: FnMut(RetryTarget) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;
        let mut target = RetryTarget::Initial;
        loop {
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => Err(Error::Cancelled),
                outcome = request(target) => outcome,
            };
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            target = match self.on_error(&error, attempt) {
                RetryDecision::RetrySame => RetryTarget::SameHost,
                RetryDecision::RetryNext => RetryTarget::NextHost,
                RetryDecision::Rethrow => return Err(error),
            };
            attempt += 1;
            debug!("Retrying request on {} after: {}", target, error);
        }
    }
}
