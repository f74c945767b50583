//! Shared subscription state for one pipeline and its derivatives
//!
//! Every pipeline derived from one root shares a single [`Subscription`] by
//! reference. Limit and skip registrations land here rather than in local
//! counters, so a limit imposed at any stage is visible to the queue bridge's
//! cooperative shutdown check, and closing the subscription is the single
//! cancellation signal observed by feeders and infinite generators.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const UNLIMITED: u64 = u64::MAX;

struct Inner {
    limit: AtomicU64,
    skip: AtomicU64,
    delivered: AtomicU64,
    closed: AtomicBool,
    hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

/// Shared limit/skip/cancellation state.
///
/// Internally synchronized; clone freely — all clones observe the same
/// state. Once closed it never reopens, and the effective limit only ever
/// tightens (limits compose by minimum).
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    pub fn new() -> Self {
        Subscription {
            inner: Arc::new(Inner {
                limit: AtomicU64::new(UNLIMITED),
                skip: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Tighten the effective limit to `min(current, n)`.
    pub fn register_limit(&self, n: u64) {
        let mut current = self.inner.limit.load(Ordering::Acquire);
        while n < current {
            match self.inner.limit.compare_exchange_weak(
                current,
                n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Add `n` elements to the prefix that will be discarded.
    pub fn register_skip(&self, n: u64) {
        self.inner.skip.fetch_add(n, Ordering::AcqRel);
    }

    /// The tightest limit registered so far, if any.
    pub fn effective_limit(&self) -> Option<u64> {
        match self.inner.limit.load(Ordering::Acquire) {
            UNLIMITED => None,
            n => Some(n),
        }
    }

    /// Elements delivered downstream so far.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Acquire)
    }

    /// Consume one skip credit. Returns true if the element must be
    /// discarded.
    pub(crate) fn consume_skip(&self) -> bool {
        let mut remaining = self.inner.skip.load(Ordering::Acquire);
        while remaining > 0 {
            match self.inner.skip.compare_exchange_weak(
                remaining,
                remaining - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => remaining = observed,
            }
        }
        false
    }

    /// Claim one delivery slot. Returns false when the limit budget is
    /// already exhausted — the element must not be delivered — in which
    /// case the subscription is closed.
    pub(crate) fn claim_delivery(&self) -> bool {
        loop {
            let delivered = self.inner.delivered.load(Ordering::Acquire);
            let limit = self.inner.limit.load(Ordering::Acquire);
            if limit != UNLIMITED && delivered >= limit {
                self.close();
                return false;
            }
            if self
                .inner
                .delivered
                .compare_exchange_weak(
                    delivered,
                    delivered + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// True once every slot allowed by the effective limit has been
    /// claimed; closes the subscription so producers stop promptly.
    pub(crate) fn limit_reached(&self) -> bool {
        let limit = self.inner.limit.load(Ordering::Acquire);
        if limit != UNLIMITED && self.inner.delivered.load(Ordering::Acquire) >= limit {
            self.close();
            true
        } else {
            false
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the subscription. Idempotent; runs every registered close hook
    /// exactly once. Safe to call from any thread.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("subscription closed after {} deliveries", self.delivered());
        let hooks = {
            let mut hooks = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    /// Register a hook to run when the subscription closes (queues to close,
    /// linked subscriptions to cascade into). Runs immediately if already
    /// closed.
    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let run_now = {
            let mut hooks = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
            if self.inner.closed.load(Ordering::Acquire) {
                true
            } else {
                hooks.push(Box::new(hook));
                return;
            }
        };
        if run_now {
            hook();
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Subscription::new()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("limit", &self.effective_limit())
            .field("skip", &self.inner.skip.load(Ordering::Relaxed))
            .field("delivered", &self.delivered())
            .field("closed", &self.is_closed())
            .finish()
    }
}
