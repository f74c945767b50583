//! Combinator library for [`Pipeline`]
//!
//! Count-, predicate- and time-based slicing, zipping, windowing, forking
//! and reordering. Every combinator that can stop consuming upstream early
//! owns an explicit release step on that exit path: the upstream
//! subscription is closed so queue-backed sources and infinite generators
//! terminate instead of leaking.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use async_stream::stream;
use futures_util::stream::{BoxStream, StreamExt};
use rand::seq::SliceRandom;
use tokio::time::Instant;

use crate::bridge::CaptureFn;
use crate::error::{RetryPolicy, StageFailure};
use crate::executor::Pool;
use crate::pipeline::Pipeline;
use crate::queue::Queue;
use crate::subscription::Subscription;
use crate::task::{Outcome, Task};

/// Pull from a task stream until the next value or failure, resolving as it
/// goes. Filtered-out elements are passed over.
async fn next_resolved<T>(
    source: &mut BoxStream<'static, Task<T>>,
) -> Option<Result<T, StageFailure>>
where
    T: Send + 'static,
{
    while let Some(task) = source.next().await {
        match task.join().await {
            Outcome::Skip => continue,
            Outcome::Value(value) => return Some(Ok(value)),
            Outcome::Failed(failure) => return Some(Err(failure)),
        }
    }
    None
}

impl<T> Pipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    // ================================
    // Count-based slicing
    // ================================

    /// Deliver at most `n` elements.
    ///
    /// Registers with the shared subscription rather than counting locally:
    /// when the bridge has delivered `n` elements the subscription closes,
    /// which closes bound queues and stops upstream producers. Limits
    /// compose by minimum and apply to the whole chain, not positionally.
    pub fn limit(self, n: usize) -> Pipeline<T> {
        self.control.register_limit(n as u64);
        self
    }

    /// Discard the first `n` delivered elements.
    ///
    /// Registers skip credits with the shared subscription; credits from
    /// repeated calls add up and are consumed before any element is
    /// delivered.
    pub fn skip(self, n: usize) -> Pipeline<T> {
        self.control.register_skip(n as u64);
        self
    }

    /// The slice `[from, to)` of the delivered sequence.
    pub fn slice(self, from: usize, to: usize) -> Pipeline<T> {
        self.skip(from).limit(to.saturating_sub(from))
    }

    // ================================
    // Predicate-based slicing
    // ================================

    /// Deliver elements while the predicate holds.
    ///
    /// The first element failing the predicate is not delivered; at that
    /// point the upstream subscription is closed so a live producer (queue
    /// feeder, infinite generator) terminates rather than leaking. Further
    /// pulls see end-of-sequence.
    pub fn limit_while<F>(self, pred: F) -> Pipeline<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let Pipeline {
            mut source,
            pool,
            retry,
            control: upstream,
            capture,
        } = self;
        let control = Subscription::new();
        {
            let upstream = upstream.clone();
            control.on_close(move || upstream.close());
        }
        let source = stream! {
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Failed(failure) => yield Task::failed(failure),
                    Outcome::Value(value) => {
                        if pred(&value) {
                            yield Task::ready(value);
                        } else {
                            upstream.close();
                            break;
                        }
                    }
                }
            }
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Deliver elements until the predicate first holds (exclusive).
    pub fn limit_until<F>(self, pred: F) -> Pipeline<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        self.limit_while(move |value| !pred(value))
    }

    /// Discard elements while the predicate holds; the first element
    /// failing it and everything after pass through unchanged.
    pub fn skip_while<F>(self, pred: F) -> Pipeline<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut dropping = true;
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Failed(failure) => yield Task::failed(failure),
                    Outcome::Value(value) => {
                        if dropping && pred(&value) {
                            continue;
                        }
                        dropping = false;
                        yield Task::ready(value);
                    }
                }
            }
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Discard elements until the predicate first holds; the triggering
    /// element and everything after pass through unchanged.
    pub fn skip_until<F>(self, pred: F) -> Pipeline<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        self.skip_while(move |value| !pred(value))
    }

    // ================================
    // Time-based slicing
    // ================================

    /// Deliver elements resolved within `duration` of the first element.
    /// On the first element past the cutoff the upstream subscription is
    /// closed, as with [`Pipeline::limit_while`].
    pub fn limit_for(self, duration: Duration) -> Pipeline<T> {
        let Pipeline {
            mut source,
            pool,
            retry,
            control: upstream,
            capture,
        } = self;
        let control = Subscription::new();
        {
            let upstream = upstream.clone();
            control.on_close(move || upstream.close());
        }
        let source = stream! {
            let mut deadline: Option<Instant> = None;
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    outcome => {
                        let cutoff = *deadline.get_or_insert_with(|| Instant::now() + duration);
                        if Instant::now() >= cutoff {
                            upstream.close();
                            break;
                        }
                        yield Task::from_outcome(outcome);
                    }
                }
            }
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Discard elements resolved within `duration` of the first element;
    /// everything after passes through unchanged.
    pub fn skip_for(self, duration: Duration) -> Pipeline<T> {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut deadline: Option<Instant> = None;
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    outcome => {
                        let cutoff = *deadline.get_or_insert_with(|| Instant::now() + duration);
                        if Instant::now() < cutoff {
                            continue;
                        }
                        yield Task::from_outcome(outcome);
                    }
                }
            }
        }
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
    // Zipping
    // ================================

    /// Pair this pipeline with another, element by element.
    ///
    /// Output length is the shorter side's length. When either side is
    /// exhausted the other side's subscription is closed, so zipping a
    /// finite pipeline against an infinite one leaves no live producer
    /// behind. A failed element replaces the pair it would have formed;
    /// both sides still advance.
    pub fn zip<U>(self, other: Pipeline<U>) -> Pipeline<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.zip_with(other, |a, b| (a, b))
    }

    /// Pair element by element, combining each pair with `f`.
    pub fn zip_with<U, R, F>(self, other: Pipeline<U>, f: F) -> Pipeline<R>
    where
        U: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        F: Fn(T, U) -> R + Send + 'static,
    {
        let Pipeline {
            source: mut left,
            pool,
            retry,
            control: left_control,
            capture,
        } = self;
        let mut right = other.source;
        let right_control = other.control;
        let control = Subscription::new();
        {
            let left_control = left_control.clone();
            let right_control = right_control.clone();
            control.on_close(move || {
                left_control.close();
                right_control.close();
            });
        }
        let source = stream! {
            loop {
                let pair = futures::future::join(
                    next_resolved(&mut left),
                    next_resolved(&mut right),
                )
                .await;
                match pair {
                    (Some(Ok(a)), Some(Ok(b))) => yield Task::ready(f(a, b)),
                    (Some(Err(failure)), Some(_)) => yield Task::failed(failure),
                    (Some(Ok(_)), Some(Err(failure))) => yield Task::failed(failure),
                    _ => break,
                }
            }
            left_control.close();
            right_control.close();
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Pair every delivered value with its index.
    pub fn zip_with_index(self) -> Pipeline<(T, u64)> {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut index = 0u64;
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Failed(failure) => yield Task::failed(failure),
                    Outcome::Value(value) => {
                        yield Task::ready((value, index));
                        index += 1;
                    }
                }
            }
        }
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
    // Windowing
    // ================================

    /// Partition the sequence into consecutive runs.
    ///
    /// A run is extended while the predicate holds on the newest element
    /// and always includes the element that broke it; the next run starts
    /// after that boundary. The final run may be shorter if the source ends
    /// mid-run.
    pub fn window_while<F>(self, pred: F) -> Pipeline<Vec<T>>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut run: Vec<T> = Vec::new();
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Failed(failure) => yield Task::failed(failure),
                    Outcome::Value(value) => {
                        let boundary = !pred(&value);
                        run.push(value);
                        if boundary {
                            yield Task::ready(std::mem::take(&mut run));
                        }
                    }
                }
            }
            if !run.is_empty() {
                yield Task::ready(std::mem::take(&mut run));
            }
        }
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
    // Forking
    // ================================

    /// Fork into two independently consumable pipelines.
    ///
    /// A single feeder drains upstream once and tees every element into two
    /// unbounded queues, so upstream work never runs twice; one side
    /// buffers while the other is drained. Closing both forks closes the
    /// upstream subscription at the next element boundary.
    pub fn duplicate(self) -> (Pipeline<T>, Pipeline<T>) {
        let Pipeline {
            mut source,
            pool,
            retry,
            control: upstream,
            capture,
        } = self;
        let first: Queue<Result<T, StageFailure>> = Queue::unbounded();
        let second: Queue<Result<T, StageFailure>> = Queue::unbounded();
        let feed_first = first.clone();
        let feed_second = second.clone();
        let feed_upstream = upstream.clone();
        tokio::spawn(async move {
            log::debug!("duplicate feeder started");
            while let Some(task) = source.next().await {
                if feed_upstream.is_closed() {
                    break;
                }
                if feed_first.is_closed() && feed_second.is_closed() {
                    feed_upstream.close();
                    break;
                }
                let item = match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Value(value) => Ok(value),
                    Outcome::Failed(failure) => Err(failure),
                };
                if !feed_first.is_closed() {
                    let _ = feed_first.push(item.clone()).await;
                }
                if !feed_second.is_closed() {
                    let _ = feed_second.push(item).await;
                }
            }
            feed_first.close();
            feed_second.close();
            log::debug!("duplicate feeder stopped");
        });
        (
            Self::from_queue(first, &pool, &retry, capture.clone()),
            Self::from_queue(second, &pool, &retry, capture),
        )
    }

    /// Split into elements matching the predicate and the rest.
    ///
    /// Teed like [`Pipeline::duplicate`]; each value lands on exactly one
    /// side. Failed elements are delivered to both sides so each consumer
    /// observes the upstream failure.
    pub fn partition<F>(self, pred: F) -> (Pipeline<T>, Pipeline<T>)
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let Pipeline {
            mut source,
            pool,
            retry,
            control: upstream,
            capture,
        } = self;
        let matching: Queue<Result<T, StageFailure>> = Queue::unbounded();
        let rest: Queue<Result<T, StageFailure>> = Queue::unbounded();
        let feed_matching = matching.clone();
        let feed_rest = rest.clone();
        let feed_upstream = upstream.clone();
        tokio::spawn(async move {
            log::debug!("partition feeder started");
            while let Some(task) = source.next().await {
                if feed_upstream.is_closed() {
                    break;
                }
                if feed_matching.is_closed() && feed_rest.is_closed() {
                    feed_upstream.close();
                    break;
                }
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Value(value) => {
                        let target = if pred(&value) {
                            &feed_matching
                        } else {
                            &feed_rest
                        };
                        if !target.is_closed() {
                            let _ = target.push(Ok(value)).await;
                        }
                    }
                    Outcome::Failed(failure) => {
                        if !feed_matching.is_closed() {
                            let _ = feed_matching.push(Err(failure.clone())).await;
                        }
                        if !feed_rest.is_closed() {
                            let _ = feed_rest.push(Err(failure)).await;
                        }
                    }
                }
            }
            feed_matching.close();
            feed_rest.close();
            log::debug!("partition feeder stopped");
        });
        (
            Self::from_queue(matching, &pool, &retry, capture.clone()),
            Self::from_queue(rest, &pool, &retry, capture),
        )
    }

    fn from_queue(
        queue: Queue<Result<T, StageFailure>>,
        pool: &Pool,
        retry: &RetryPolicy,
        capture: Option<CaptureFn>,
    ) -> Pipeline<T> {
        let control = Subscription::new();
        {
            let queue = queue.clone();
            control.on_close(move || queue.close());
        }
        let source = queue
            .into_stream()
            .map(|item| match item {
                Ok(value) => Task::ready(value),
                Err(failure) => Task::failed(failure),
            })
            .boxed();
        Pipeline {
            source,
            pool: pool.clone(),
            retry: retry.clone(),
            control,
            capture,
        }
    }

    // ================================
    // Reordering
    // ================================

    /// Reverse the sequence. Materializing — careful with infinite
    /// pipelines!
    pub fn reverse(self) -> Pipeline<T> {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut items: Vec<Result<T, StageFailure>> = Vec::new();
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Value(value) => items.push(Ok(value)),
                    Outcome::Failed(failure) => items.push(Err(failure)),
                }
            }
            for item in items.into_iter().rev() {
                match item {
                    Ok(value) => yield Task::ready(value),
                    Err(failure) => yield Task::failed(failure),
                }
            }
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Shuffle the sequence. Materializing — careful with infinite
    /// pipelines!
    pub fn shuffle(self) -> Pipeline<T> {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut items: Vec<Result<T, StageFailure>> = Vec::new();
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Value(value) => items.push(Ok(value)),
                    Outcome::Failed(failure) => items.push(Err(failure)),
                }
            }
            {
                let mut rng = rand::thread_rng();
                items.shuffle(&mut rng);
            }
            for item in items {
                match item {
                    Ok(value) => yield Task::ready(value),
                    Err(failure) => yield Task::failed(failure),
                }
            }
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Shuffle using the given source of randomness.
    pub fn shuffle_with<R>(self, mut rng: R) -> Pipeline<T>
    where
        R: rand::RngCore + Send + 'static,
    {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut items: Vec<Result<T, StageFailure>> = Vec::new();
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Value(value) => items.push(Ok(value)),
                    Outcome::Failed(failure) => items.push(Err(failure)),
                }
            }
            items.shuffle(&mut rng);
            for item in items {
                match item {
                    Ok(value) => yield Task::ready(value),
                    Err(failure) => yield Task::failed(failure),
                }
            }
        }
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
    // Element insertion and dedup
    // ================================

    /// Insert `separator` between any two consecutive elements.
    pub fn intersperse(self, separator: T) -> Pipeline<T> {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut first = true;
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    outcome => {
                        if !first {
                            yield Task::ready(separator.clone());
                        }
                        first = false;
                        yield Task::from_outcome(outcome);
                    }
                }
            }
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Drop elements already seen. Buffers the set of observed values —
    /// finite cardinality expected.
    pub fn distinct(self) -> Pipeline<T>
    where
        T: Eq + Hash,
    {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut seen = HashSet::new();
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Failed(failure) => yield Task::failed(failure),
                    Outcome::Value(value) => {
                        if seen.insert(value.clone()) {
                            yield Task::ready(value);
                        }
                    }
                }
            }
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }

    /// Left scan: emits the seed, then every intermediate accumulation.
    pub fn scan_left<R, F>(self, seed: R, f: F) -> Pipeline<R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(R, T) -> R + Send + 'static,
    {
        let Pipeline {
            mut source,
            pool,
            retry,
            control,
            capture,
        } = self;
        let source = stream! {
            let mut acc = seed;
            yield Task::ready(acc.clone());
            while let Some(task) = source.next().await {
                match task.join().await {
                    Outcome::Skip => continue,
                    Outcome::Failed(failure) => yield Task::failed(failure),
                    Outcome::Value(value) => {
                        acc = f(acc, value);
                        yield Task::ready(acc.clone());
                    }
                }
            }
        }
        .boxed();
        Pipeline {
            source,
            pool,
            retry,
            control,
            capture,
        }
    }
}
