//! Worker pool and retry-aware execution binding
//!
//! A [`Pool`] bounds how many stage functions run at once. Work is scheduled
//! on the tokio runtime; the pool's semaphore is held only while the user
//! function itself runs, never while waiting on upstream elements, so a
//! one-permit pool gives deterministic sequential execution without
//! deadlocking chained stages.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;

use crate::error::{BoxError, Panicked, RetryPolicy, StageError, StageFailure};
use crate::task::{Outcome, StageFn};

lazy_static::lazy_static! {
    static ref STANDARD_POOL: Pool = Pool::bounded(num_cpus::get());
}

/// A bounded-parallelism worker pool.
#[derive(Clone)]
pub struct Pool {
    permits: Arc<Semaphore>,
    width: usize,
}

impl Pool {
    /// A pool running at most `width` stage functions concurrently.
    pub fn bounded(width: usize) -> Self {
        let width = width.max(1);
        Pool {
            permits: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    /// A fresh one-permit pool: work runs one element at a time, in
    /// submission order.
    pub fn sequential() -> Self {
        Pool::bounded(1)
    }

    /// The shared process-wide pool, sized to the number of CPUs.
    pub fn standard() -> Self {
        STANDARD_POOL.clone()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.permits.clone().acquire_owned().await
    }

    /// Run a one-shot unit of work, capturing panics as failures.
    pub(crate) async fn run_once<T, F>(&self, work: F) -> Outcome<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let permit = match self.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return Outcome::Failed(StageFailure::new(Arc::new(StageError::Cancelled), (), 1))
            }
        };
        let result = catch_unwind(AssertUnwindSafe(work));
        drop(permit);
        match result {
            Ok(value) => Outcome::Value(value),
            Err(payload) => Outcome::Failed(StageFailure::new(
                Arc::new(Panicked(panic_message(payload))),
                (),
                1,
            )),
        }
    }

    /// Run a stage function against one input, guarded by a retry policy.
    ///
    /// Failures (including panics) are retried against the same input up to
    /// the policy's budget, sleeping the policy's backoff between attempts.
    /// A terminal failure carries the input and the total attempt count.
    pub(crate) async fn run_stage<T, R>(
        &self,
        retry: &RetryPolicy,
        input: T,
        work: &StageFn<T, R>,
    ) -> Outcome<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
    {
        let budget = retry.max_retries();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let permit = match self.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Outcome::Failed(StageFailure::new(
                        Arc::new(StageError::Cancelled),
                        input,
                        attempt as u32,
                    ))
                }
            };
            let result = catch_unwind(AssertUnwindSafe(|| work(input.clone())));
            drop(permit);

            let cause: BoxError = match result {
                Ok(Ok(value)) => return Outcome::Value(value),
                Ok(Err(cause)) => cause,
                Err(payload) => Box::new(Panicked(panic_message(payload))),
            };

            if attempt > budget {
                if budget > 0 {
                    log::error!("stage failed after {} attempts: {}", attempt, cause);
                }
                return Outcome::Failed(StageFailure::new(
                    Arc::from(cause),
                    input,
                    attempt as u32,
                ));
            }

            log::warn!(
                "stage attempt {}/{} failed, retrying: {}",
                attempt,
                budget + 1,
                cause
            );
            let delay = retry.backoff(attempt);
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("width", &self.width)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
