//! FlowStream — a lazily-evaluated, asynchronously-executed stream
//! processing engine.
//!
//! A [`Pipeline`] is an immutable chain of transformation stages whose
//! elements are computed on a configurable worker [`Pool`], with per-stage
//! [`RetryPolicy`] guarding, cooperative cancellation through a shared
//! [`Subscription`], and queue-mediated consumption through a [`Cursor`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod queue;
pub mod subscription;
pub mod task;

mod combinators;

pub use bridge::Cursor;
pub use config::BridgeConfig;
pub use error::{BoxError, Panicked, RetryPolicy, StageError, StageFailure};
pub use executor::Pool;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use queue::{Queue, QueueError};
pub use subscription::Subscription;
pub use task::{Outcome, Task};
