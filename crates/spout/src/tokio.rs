use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};

/// Fallback runtime, built on first use.
///
/// [`effect::run`](crate::effect::run) blocks on it, [`join`](crate::join)
/// spawns branches on it when called outside a runtime, and streams dropped
/// outside a runtime release their resources on it.
pub static TOKIO: Lazy<Runtime> = Lazy::new(|| {
    static WORKERS: AtomicUsize = AtomicUsize::new(0);
    Builder::new_multi_thread()
        .thread_name_fn(|| format!("spout-worker-{}", WORKERS.fetch_add(1, Ordering::Relaxed)))
        .enable_all()
        .build()
        .expect("failed to build the spout runtime")
});
