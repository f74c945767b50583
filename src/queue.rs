//! Bounded, closeable FIFO between producers and a consumer
//!
//! The queue is the blocking boundary of the engine: `push` applies
//! backpressure while the queue is full, `pop` waits while it is empty, and
//! `close` is the idempotent signal that unblocks both sides. Closing never
//! drops already-queued items — consumers drain them before seeing
//! end-of-sequence.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_stream::stream;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};

/// Error types for queue operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    /// The queue has been closed
    #[error("queue is closed")]
    Closed,
    /// The queue is full (bounded queues, non-blocking push only)
    #[error("queue is full")]
    Full,
    /// The underlying channel disconnected
    #[error("queue channel disconnected")]
    Disconnected,
}

struct Shared<T> {
    sender: mpsc::Sender<T>,
    capacity: Option<usize>,
    len: AtomicUsize,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Concurrent FIFO of elements with an explicit close operation.
pub struct Queue<T> {
    state: Arc<Shared<T>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            state: Arc::clone(&self.state),
            receiver: Arc::clone(&self.receiver),
        }
    }
}

impl<T> Queue<T>
where
    T: Send + 'static,
{
    /// Create a new bounded queue with the given capacity.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_channel(capacity.max(1), Some(capacity.max(1)))
    }

    /// Create a queue without a practical capacity bound.
    pub fn unbounded() -> Self {
        Self::with_channel(1_000_000, None)
    }

    fn with_channel(channel_capacity: usize, capacity: Option<usize>) -> Self {
        let (sender, receiver) = mpsc::channel(channel_capacity);
        Queue {
            state: Arc::new(Shared {
                sender,
                capacity,
                len: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    /// Push an element, waiting while the queue is full.
    ///
    /// Returns `Err(QueueError::Closed)` if the queue is closed, including
    /// when `close` happens while this push is blocked on a full queue.
    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let notified = self.state.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        tokio::select! {
            result = self.state.sender.send(item) => match result {
                Ok(()) => {
                    self.state.len.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => Err(QueueError::Disconnected),
            },
            _ = &mut notified => Err(QueueError::Closed),
        }
    }

    /// Push an element without waiting.
    pub fn try_push(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        match self.state.sender.try_send(item) {
            Ok(()) => {
                self.state.len.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Closed(_)) => Err(QueueError::Disconnected),
        }
    }

    /// Pop the next element, waiting while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and drained — the
    /// end-of-sequence signal, distinct from any element-level failure.
    pub async fn pop(&self) -> Option<T> {
        let mut rx = self.receiver.lock().await;
        loop {
            match rx.try_recv() {
                Ok(item) => {
                    self.state.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(item);
                }
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            if self.is_closed() {
                return None;
            }
            let notified = self.state.close_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => {
                        self.state.len.fetch_sub(1, Ordering::Relaxed);
                        return Some(item);
                    }
                    None => return None,
                },
                // Closed while waiting: loop once more to drain anything
                // that raced in, then observe the closed flag.
                _ = &mut notified => {}
            }
        }
    }

    /// Close the queue. Idempotent; wakes every blocked pusher and popper.
    /// Already-queued elements remain poppable.
    pub fn close(&self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            log::debug!("queue closed with {} element(s) buffered", self.len());
        }
        self.state.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Capacity of the queue (`None` for unbounded).
    pub fn capacity(&self) -> Option<usize> {
        self.state.capacity
    }

    /// Current number of buffered elements (may lag under contention).
    pub fn len(&self) -> usize {
        self.state.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the queue as a stream, ending when it is closed and drained.
    pub fn into_stream(self) -> BoxStream<'static, T> {
        Box::pin(stream! {
            while let Some(item) = self.pop().await {
                yield item;
            }
        })
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.state.capacity)
            .field("length", &self.state.len.load(Ordering::Relaxed))
            .field("is_closed", &self.state.closed.load(Ordering::Acquire))
            .finish()
    }
}
