//! Helpers shared by the tests of spout and the crates built on it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{Data, Result, Stream};

pub fn init_test_logger() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("debug"))
        .expect("valid default filter");

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(env_filter)
        .try_init();
}

/// Counts acquisitions and releases of test resources.
#[derive(Clone, Debug, Default)]
pub struct LeakCounter {
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl LeakCounter {
    /// Records an acquisition and returns its id.
    pub fn acquire(&self) -> Result<usize> {
        Ok(self.acquired.fetch_add(1, Ordering::AcqRel))
    }

    pub fn release(&self, _id: usize) -> Result<()> {
        self.released.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }

    /// Resources acquired but not yet released.
    pub fn open(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }

    /// Wraps `stream` in a bracket that counts as one resource.
    pub fn bracketed<O: Data>(&self, stream: Stream<O>) -> Stream<O> {
        let acquire = self.clone();
        let release = self.clone();
        Stream::bracket(
            async move { acquire.acquire() },
            move |_| stream,
            move |id| async move { release.release(id) },
        )
    }
}
