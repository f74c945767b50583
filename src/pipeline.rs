//! The pipeline: a lazy, immutable chain of transformation stages
//!
//! A [`Pipeline`] wraps a lazy sequence of [`Task`] handles together with
//! its execution bindings: the worker pool and retry policy used by the
//! *next* transformation, the [`Subscription`] shared by every pipeline
//! derived from the same root, and an optional capture handler for
//! unrecovered failures. Every operator consumes the pipeline and returns a
//! new one; already-created handles are never re-executed.

use std::sync::Arc;

use async_stream::stream;
use futures_core::Stream;
use futures_util::stream::{self, BoxStream, FuturesOrdered, StreamExt};

use crate::bridge::{self, CaptureFn, Cursor};
use crate::config::BridgeConfig;
use crate::error::{BoxError, RetryPolicy, StageError, StageFailure};
use crate::executor::Pool;
use crate::subscription::Subscription;
use crate::task::{Outcome, StageFn, Task};

/// A lazily-evaluated, asynchronously-executed sequence of elements.
pub struct Pipeline<T> {
    pub(crate) source: BoxStream<'static, Task<T>>,
    pub(crate) pool: Pool,
    pub(crate) retry: RetryPolicy,
    pub(crate) control: Subscription,
    pub(crate) capture: Option<CaptureFn>,
}

impl<T> Pipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    // ================================
    // Constructors
    // ================================

    /// Create a pipeline over the given values.
    ///
    /// # Examples
    /// ```
    /// use flowstream::Pipeline;
    ///
    /// # async fn example() {
    /// let result = Pipeline::of(vec![1, 2, 3])
    ///     .map(|x| x * 2)
    ///     .to_vec()
    ///     .await
    ///     .unwrap();
    /// assert_eq!(result, vec![2, 4, 6]);
    /// # }
    /// ```
    pub fn of<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_iter(values)
    }

    /// Create a pipeline from an iterator.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_tasks(stream::iter(iter.into_iter().map(Task::ready)).boxed())
    }

    /// Create an empty pipeline that completes immediately.
    pub fn empty() -> Self {
        Self::from_tasks(stream::empty().boxed())
    }

    /// Create an infinite pipeline from a seed and a step function.
    ///
    /// The generator checks the shared subscription between elements and
    /// stops as soon as it closes, so a downstream `limit` or cursor close
    /// terminates it promptly.
    pub fn iterate<F>(seed: T, f: F) -> Self
    where
        F: Fn(&T) -> T + Send + 'static,
    {
        let control = Subscription::new();
        let generator = control.clone();
        let source = stream! {
            let mut current = seed;
            loop {
                if generator.is_closed() {
                    break;
                }
                let next = f(&current);
                yield Task::ready(std::mem::replace(&mut current, next));
            }
        }
        .boxed();
        Self::from_tasks_with(source, control)
    }

    /// Create an infinite pipeline from a supplier function.
    ///
    /// Cooperatively cancellable, like [`Pipeline::iterate`].
    pub fn generate<F>(supplier: F) -> Self
    where
        F: Fn() -> T + Send + 'static,
    {
        let control = Subscription::new();
        let generator = control.clone();
        let source = stream! {
            loop {
                if generator.is_closed() {
                    break;
                }
                yield Task::ready(supplier());
            }
        }
        .boxed();
        Self::from_tasks_with(source, control)
    }

    /// Wrap an existing stream of values.
    pub fn from_stream<S>(s: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::from_tasks(s.map(Task::ready).boxed())
    }

    fn from_tasks(source: BoxStream<'static, Task<T>>) -> Self {
        Self::from_tasks_with(source, Subscription::new())
    }

    fn from_tasks_with(source: BoxStream<'static, Task<T>>, control: Subscription) -> Self {
        Pipeline {
            source,
            pool: Pool::standard(),
            retry: RetryPolicy::None,
            control,
            capture: None,
        }
    }

    // ================================
    // Execution bindings
    // ================================

    /// Use `pool` for transformations applied after this call.
    /// Already-created stages keep the pool they were bound to.
    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = pool;
        self
    }

    /// Use `retry` for transformations applied after this call.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The subscription shared by every pipeline derived from this root.
    pub fn subscription(&self) -> Subscription {
        self.control.clone()
    }

    // ================================
    // Stage transformations
    // ================================

    /// Transform every element on the bound pool, guarded by the bound
    /// retry policy. Lazy: no work is scheduled until the pipeline is
    /// driven. A panicking function produces an element failure carrying
    /// the input, not a crashed worker.
    pub fn map<R, F>(self, f: F) -> Pipeline<R>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let work: Arc<StageFn<T, R>> = Arc::new(move |input| Ok(f(input)));
        self.stage(work)
    }

    /// Transform every element with a fallible function. An `Err` is
    /// retried per the bound policy; when the budget is exhausted the
    /// element resolves to a failure carrying the original input.
    pub fn try_map<R, E, F>(self, f: F) -> Pipeline<R>
    where
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let work: Arc<StageFn<T, R>> =
            Arc::new(move |input| f(input).map_err(|e| Box::new(e) as BoxError));
        self.stage(work)
    }

    fn stage<R>(self, work: Arc<StageFn<T, R>>) -> Pipeline<R>
    where
        R: Clone + Send + Sync + 'static,
    {
        let Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let stage_pool = pool.clone();
        let stage_retry = retry.clone();
        let source = source
            .map(move |task| task.then(&stage_pool, &stage_retry, Arc::clone(&work)))
            .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Keep only elements whose resolved value satisfies the predicate.
    /// The predicate runs inline, not on the pool — it is assumed cheap.
    pub fn filter<F>(self, pred: F) -> Pipeline<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        self.inline(move |outcome| {
            let pred = Arc::clone(&pred);
            async move {
                match outcome {
                    Outcome::Value(value) => {
                        if pred(&value) {
                            Outcome::Value(value)
                        } else {
                            Outcome::Skip
                        }
                    }
                    other => other,
                }
            }
        })
    }

    /// Observe every resolved value without transforming it.
    pub fn peek<F>(self, f: F) -> Pipeline<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.inline(move |outcome| {
            let f = Arc::clone(&f);
            async move {
                if let Outcome::Value(value) = &outcome {
                    f(value);
                }
                outcome
            }
        })
    }

    /// Recover failed elements with a catch-all handler.
    ///
    /// The handler receives the failure — cause plus the original input —
    /// and may substitute a value; returning `None` leaves the failure in
    /// place. Runs inline on whichever worker observes the failure, so it
    /// must not block.
    pub fn on_fail<F>(self, handler: F) -> Pipeline<T>
    where
        F: Fn(&StageFailure) -> Option<T> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.inline(move |outcome| {
            let handler = Arc::clone(&handler);
            async move {
                match outcome {
                    Outcome::Failed(failure) => match handler(&failure) {
                        Some(value) => Outcome::Value(value),
                        None => Outcome::Failed(failure),
                    },
                    other => other,
                }
            }
        })
    }

    /// Recover failed elements whose cause is of type `E`.
    pub fn on_fail_for<E, F>(self, handler: F) -> Pipeline<T>
    where
        E: std::error::Error + 'static,
        F: Fn(&E, &StageFailure) -> T + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.inline(move |outcome| {
            let handler = Arc::clone(&handler);
            async move {
                match outcome {
                    Outcome::Failed(failure) => {
                        let recovered = failure.cause_ref::<E>().map(|cause| handler(cause, &failure));
                        match recovered {
                            Some(value) => Outcome::Value(value),
                            None => Outcome::Failed(failure),
                        }
                    }
                    other => other,
                }
            }
        })
    }

    /// Route unrecovered failures to a side-channel consumer.
    ///
    /// Captured elements are dropped from the main sequence: they are
    /// neither delivered nor counted against limits or skips.
    pub fn capture<F>(mut self, consumer: F) -> Pipeline<T>
    where
        F: Fn(StageFailure) + Send + Sync + 'static,
    {
        self.capture = Some(Arc::new(consumer));
        self
    }

    /// Chain a cheap per-element transformation that runs inline when the
    /// element is driven.
    pub(crate) fn inline<F, Fut>(self, f: F) -> Pipeline<T>
    where
        F: Fn(Outcome<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Outcome<T>> + Send + 'static,
    {
        let Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let f = Arc::new(f);
        let source = source
            .map(move |task| {
                let f = Arc::clone(&f);
                Task::deferred(async move { f(task.join().await).await })
            })
            .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    // ================================
    // Merging
    // ================================

    /// Concatenate two pipelines sequentially: every element of `self`
    /// precedes every element of `other`. Closing the combined pipeline
    /// cascades into `other`'s subscription so neither side leaks a
    /// producer.
    pub fn concat(self, other: Pipeline<T>) -> Pipeline<T> {
        let Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let other_control = other.control;
        {
            let other_control = other_control.clone();
            control.on_close(move || other_control.close());
        }
        let source = source.chain(other.source).boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Merge two pipelines, interleaved as elements become available.
    ///
    /// Order-relaxed by design: no relative ordering between the two sides
    /// is guaranteed. Use [`Pipeline::concat`] when sequential ordering
    /// matters.
    pub fn merge(self, other: Pipeline<T>) -> Pipeline<T> {
        let Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let other_control = other.control;
        {
            let other_control = other_control.clone();
            control.on_close(move || other_control.close());
        }
        let source = stream::select(source, other.source).boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    // ================================
    // Terminal operations
    // ================================

    /// Force every element to resolve, in index order.
    ///
    /// Surfaces the first unrecovered failure and closes the subscription
    /// before returning it, so upstream producers are released even on the
    /// error path.
    pub async fn to_vec(self) -> Result<Vec<T>, StageError> {
        let mut out = Vec::new();
        self.drive(|value| out.push(value)).await?;
        Ok(out)
    }

    /// Drive the pipeline for side effects.
    pub async fn for_each<F>(self, f: F) -> Result<(), StageError>
    where
        F: FnMut(T) + Send,
    {
        self.drive(f).await
    }

    /// Bridge into a pull-based cursor with default configuration.
    pub fn into_cursor(self) -> Cursor<T> {
        self.into_cursor_with(BridgeConfig::default())
    }

    /// Bridge into a pull-based cursor.
    ///
    /// Spawns a background feeder that resolves elements ahead of the
    /// consumer, bounded by the bridge queue's capacity.
    pub fn into_cursor_with(self, config: BridgeConfig) -> Cursor<T> {
        let Pipeline {
            source,
            pool,
            retry: _,
            control,
            capture,
        } = self;
        bridge::spawn(source, &pool, control, capture, config)
    }

    /// Resolve elements with a bounded ordered window, handing each
    /// delivered value to `on_value`. Shared by the terminal operations.
    async fn drive<F>(self, mut on_value: F) -> Result<(), StageError>
    where
        F: FnMut(T) + Send,
    {
        let Pipeline {
            mut source,
            pool,
            retry: _,
            control,
            capture,
        } = self;
        let window = pool.width().max(1);
        let mut in_flight = FuturesOrdered::new();
        let mut upstream_done = false;
        loop {
            if control.is_closed() {
                break;
            }
            while !upstream_done && in_flight.len() < window {
                match source.next().await {
                    Some(task) => in_flight.push_back(task.join()),
                    None => upstream_done = true,
                }
            }
            let outcome = match in_flight.next().await {
                Some(outcome) => outcome,
                None => break,
            };
            match outcome {
                Outcome::Skip => {}
                Outcome::Value(value) => {
                    if control.consume_skip() {
                        continue;
                    }
                    if !control.claim_delivery() {
                        break;
                    }
                    on_value(value);
                    if control.limit_reached() {
                        break;
                    }
                }
                Outcome::Failed(failure) => {
                    if let Some(capture) = capture.as_ref() {
                        capture(failure);
                        continue;
                    }
                    if control.consume_skip() {
                        continue;
                    }
                    control.close();
                    return Err(StageError::Element(failure));
                }
            }
        }
        control.close();
        Ok(())
    }
}

/// Builder configuring the execution bindings of new root pipelines.
///
/// Mirrors the two canonical setups: a parallel root over the shared
/// CPU-sized pool, and a sequential root whose elements execute one at a
/// time in submission order.
#[derive(Clone)]
pub struct PipelineBuilder {
    pool: Pool,
    retry: RetryPolicy,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::parallel()
    }

    /// Roots built here run stages on the shared CPU-sized pool.
    pub fn parallel() -> Self {
        PipelineBuilder {
            pool: Pool::standard(),
            retry: RetryPolicy::None,
        }
    }

    /// Roots built here run stages one element at a time, giving
    /// deterministic sequential semantics.
    pub fn sequential() -> Self {
        PipelineBuilder {
            pool: Pool::sequential(),
            retry: RetryPolicy::None,
        }
    }

    /// Use a pool bounded to `n` concurrent stage executions.
    pub fn parallelism(mut self, n: usize) -> Self {
        self.pool = Pool::bounded(n);
        self
    }

    pub fn pool(mut self, pool: Pool) -> Self {
        self.pool = pool;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn of<T, I>(&self, values: I) -> Pipeline<T>
    where
        T: Clone + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Pipeline::of(values)
            .with_pool(self.pool.clone())
            .with_retry(self.retry.clone())
    }

    pub fn from_iter<T, I>(&self, iter: I) -> Pipeline<T>
    where
        T: Clone + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.of(iter)
    }

    pub fn iterate<T, F>(&self, seed: T, f: F) -> Pipeline<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) -> T + Send + 'static,
    {
        Pipeline::iterate(seed, f)
            .with_pool(self.pool.clone())
            .with_retry(self.retry.clone())
    }

    pub fn generate<T, F>(&self, supplier: F) -> Pipeline<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> T + Send + 'static,
    {
        Pipeline::generate(supplier)
            .with_pool(self.pool.clone())
            .with_retry(self.retry.clone())
    }

    pub fn from_stream<T, S>(&self, s: S) -> Pipeline<T>
    where
        T: Clone + Send + Sync + 'static,
        S: Stream<Item = T> + Send + 'static,
    {
        Pipeline::from_stream(s)
            .with_pool(self.pool.clone())
            .with_retry(self.retry.clone())
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
