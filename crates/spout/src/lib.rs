//! Resource-safe pull streams.
//!
//! A [`Pull`] is a lazy, step-at-a-time computation that emits [`Chunk`]s,
//! composes with other pulls, and ties resource acquisition to guaranteed
//! release. A [`Stream`] drives a pull from the consumer side. On top of
//! these, [`Signal`] provides a concurrently shared cell with atomic
//! compare-and-set, [`time`] provides clock-driven streams, and [`join`]
//! runs many streams concurrently with bounded parallelism.

pub mod chunk;
pub mod collector;
pub mod effect;
pub mod error;
pub mod join;
pub mod pull;
pub mod signal;
pub mod stream;
pub mod time;
pub mod tokio;

#[doc(hidden)]
pub mod test;

pub use chunk::Chunk;
pub use collector::Collector;
pub use effect::Effect;
pub use error::{Error, Result};
pub use join::{join, join_on};
pub use pull::{Pull, PullContext, Scope, Upstream};
pub use signal::{Change, Signal};
pub use stream::Stream;
pub use time::{Scheduler, TokioScheduler};

/// Types that can flow through a stream.
pub trait Data: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Data for T {}
