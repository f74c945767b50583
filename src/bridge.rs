//! Queue bridge: asynchronous production to pull-based consumption
//!
//! A background feeder drains the pipeline's task stream into a bounded
//! [`Queue`], resolving a window of elements concurrently while delivering
//! them in index order. The consuming side pulls from a [`Cursor`] at its
//! own pace; the queue's capacity is the backpressure bound. The feeder
//! polls the shared subscription between elements and terminates promptly
//! when it closes.

use std::sync::Arc;

use futures::stream::{BoxStream, FuturesOrdered, StreamExt};

use crate::config::BridgeConfig;
use crate::error::StageFailure;
use crate::executor::Pool;
use crate::queue::Queue;
use crate::subscription::Subscription;
use crate::task::{Outcome, Task};

pub(crate) type CaptureFn = Arc<dyn Fn(StageFailure) + Send + Sync>;

/// Pull-based consumer end of a bridged pipeline.
///
/// `next` re-raises element failures at the point of consumption,
/// preserving the cause/input pairing captured when the element failed.
/// `None` means the sequence ended or was cancelled — graceful termination,
/// never an error.
pub struct Cursor<T> {
    queue: Queue<Result<T, StageFailure>>,
    control: Subscription,
}

impl<T> Cursor<T>
where
    T: Send + 'static,
{
    /// Pop the next element, waiting while production is behind.
    pub async fn next(&mut self) -> Option<Result<T, StageFailure>> {
        self.queue.pop().await
    }

    /// Close the cursor: cancels upstream production cooperatively.
    pub fn close(&self) {
        self.control.close();
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// The subscription shared with the upstream pipeline.
    pub fn subscription(&self) -> Subscription {
        self.control.clone()
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        // A dropped consumer must not leave a live feeder behind.
        self.control.close();
    }
}

pub(crate) fn spawn<T>(
    source: BoxStream<'static, Task<T>>,
    pool: &Pool,
    control: Subscription,
    capture: Option<CaptureFn>,
    config: BridgeConfig,
) -> Cursor<T>
where
    T: Send + 'static,
{
    let queue = Queue::bounded(config.capacity);
    {
        let queue = queue.clone();
        control.on_close(move || queue.close());
    }
    let window = config.in_flight.unwrap_or_else(|| pool.width()).max(1);
    tokio::spawn(feed(
        source,
        queue.clone(),
        control.clone(),
        capture,
        window,
    ));
    Cursor { queue, control }
}

/// Drain the task stream into the queue.
///
/// Keeps up to `window` elements resolving at once; `FuturesOrdered`
/// re-establishes index order even when the pool completes out of order.
/// Skip credits and the limit budget are accounted against the shared
/// subscription so they compose across every derived pipeline.
async fn feed<T>(
    mut source: BoxStream<'static, Task<T>>,
    queue: Queue<Result<T, StageFailure>>,
    control: Subscription,
    capture: Option<CaptureFn>,
    window: usize,
) where
    T: Send + 'static,
{
    log::debug!("bridge feeder started (window {})", window);
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
                if queue.push(Ok(value)).await.is_err() {
                    break;
                }
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
                if !control.claim_delivery() {
                    break;
                }
                if queue.push(Err(failure)).await.is_err() {
                    break;
                }
                if control.limit_reached() {
                    break;
                }
            }
        }
    }
    queue.close();
    log::debug!(
        "bridge feeder stopped after {} delivery(ies)",
        control.delivered()
    );
}
