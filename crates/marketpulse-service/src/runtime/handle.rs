use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, FetchResult};

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(FetchError),
    /// The task was interrupted before it completed.
    Interrupted,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Converts into a `Result`, treating an interruption as [`FetchError::Cancelled`].
    pub fn into_result(self) -> FetchResult<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(err) => Err(err),
            Self::Interrupted => Err(FetchError::Cancelled),
        }
    }

    /// A short, stable name usable as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Success(_) => "ok",
            Self::Failure(err) => err.metrics_tag(),
            Self::Interrupted => "interrupted",
        }
    }
}

impl<T> From<FetchResult<T>> for Outcome<T> {
    fn from(result: FetchResult<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::Failure(err),
        }
    }
}

/// A task running on a [`MarketRuntime`](super::MarketRuntime).
///
/// Dropping the handle detaches the task. Use [`interrupt`](Self::interrupt) to stop it.
#[derive(Debug)]
pub struct TaskHandle<T> {
    pub(super) token: CancellationToken,
    pub(super) join: JoinHandle<Outcome<T>>,
}

impl<T> TaskHandle<T> {
    /// Interrupts the task and every task forked from within it.
    ///
    /// The task stops at its next suspension point and resolves to [`Outcome::Interrupted`].
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// The cancellation token the task runs under.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Waits for the task to end.
    pub async fn join(self) -> Outcome<T> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => Outcome::Interrupted,
            // the task panicked
            Err(err) => Outcome::Failure(FetchError::from(err)),
        }
    }
}
