//! Per-element task handles
//!
//! A [`Task`] represents one sequence element's deferred computation: it may
//! already hold a value, be running on a worker pool, or be a chained
//! transformation of an upstream handle. A handle resolves exactly once and
//! is never re-executed.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use tokio::task::JoinHandle;

use crate::error::{BoxError, Panicked, StageFailure};
use crate::executor::Pool;
use crate::error::RetryPolicy;

/// Resolution of a [`Task`].
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The element's computed value.
    Value(T),
    /// The element was removed from the sequence (failed a filter, or was
    /// consumed by a capture handler).
    Skip,
    /// The transformation failed; carries the cause and the original input.
    Failed(StageFailure),
}

/// Stage function shape shared by all pooled transformations.
pub type StageFn<T, R> = dyn Fn(T) -> Result<R, BoxError> + Send + Sync;

enum TaskState<T> {
    Ready(Outcome<T>),
    Spawned(JoinHandle<Outcome<T>>),
    Deferred(BoxFuture<'static, Outcome<T>>),
}

/// A deferred result for one sequence element.
pub struct Task<T> {
    state: TaskState<T>,
}

impl<T: Send + 'static> Task<T> {
    /// A handle that is already resolved to `value`.
    pub fn ready(value: T) -> Self {
        Task {
            state: TaskState::Ready(Outcome::Value(value)),
        }
    }

    /// A handle resolved to a removed element.
    pub fn skipped() -> Self {
        Task {
            state: TaskState::Ready(Outcome::Skip),
        }
    }

    /// A handle resolved to a failure.
    pub fn failed(failure: StageFailure) -> Self {
        Task {
            state: TaskState::Ready(Outcome::Failed(failure)),
        }
    }

    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        Task {
            state: TaskState::Ready(outcome),
        }
    }

    /// Submit a unit of work to a pool and wrap its eventual result.
    ///
    /// The work starts immediately; the returned handle resolves when the
    /// pool has run it. Panics inside the work are captured as failures.
    pub fn submit<F>(pool: &Pool, work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let pool = pool.clone();
        let handle = tokio::spawn(async move { pool.run_once(work).await });
        Task {
            state: TaskState::Spawned(handle),
        }
    }

    /// A handle that resolves by driving `fut` inline when joined.
    ///
    /// Used for cheap per-element work (filter predicates, recovery
    /// handlers) that does not warrant a pool submission.
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        Task {
            state: TaskState::Deferred(fut.boxed()),
        }
    }

    /// Chain a pooled transformation onto this handle.
    ///
    /// The returned handle resolves once this handle has resolved and `work`
    /// has been run against its value on `pool`, guarded by `retry`. Skips
    /// and failures pass through untouched.
    pub(crate) fn then<R>(self, pool: &Pool, retry: &RetryPolicy, work: Arc<StageFn<T, R>>) -> Task<R>
    where
        T: Clone + Sync,
        R: Send + 'static,
    {
        let pool = pool.clone();
        let retry = retry.clone();
        let handle = tokio::spawn(async move {
            match self.join().await {
                Outcome::Value(value) => pool.run_stage(&retry, value, work.as_ref()).await,
                Outcome::Skip => Outcome::Skip,
                Outcome::Failed(failure) => Outcome::Failed(failure),
            }
        });
        Task {
            state: TaskState::Spawned(handle),
        }
    }

    /// Resolve the handle: the computed value, or the captured failure.
    pub async fn join(self) -> Outcome<T> {
        match self.state {
            TaskState::Ready(outcome) => outcome,
            TaskState::Spawned(handle) => match handle.await {
                Ok(outcome) => outcome,
                // The worker task was torn down underneath us (runtime
                // shutdown or an uncaught panic path).
                Err(join_err) => Outcome::Failed(StageFailure::new(
                    Arc::new(Panicked(join_err.to_string())),
                    (),
                    1,
                )),
            },
            TaskState::Deferred(fut) => fut.await,
        }
    }
}
