//! Suspended, possibly asynchronous computations.
//!
//! An [`Effect`] is a boxed future producing a [`Result`]. Sequencing uses the
//! combinators of [`TryFutureExt`](futures::TryFutureExt) (`map_ok`,
//! `and_then`), suspension uses [`suspend`], and [`run`] drives an effect to
//! completion from synchronous code.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::tokio::TOKIO;
use crate::Result;

/// A boxed computation yielding `T` or failing.
pub type Effect<T> = BoxFuture<'static, Result<T>>;

/// Lifts a value into an effect.
pub fn pure<T: Send + 'static>(value: T) -> Effect<T> {
    futures::future::ready(Ok(value)).boxed()
}

/// Defers `f` until the effect is first polled.
pub fn suspend<T, F>(f: F) -> Effect<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    futures::future::lazy(move |_| f()).boxed()
}

/// Runs `effect` to completion, blocking the calling thread.
///
/// Must not be called from within an asynchronous context.
pub fn run<T, F>(effect: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    TOKIO.block_on(effect)
}

#[cfg(test)]
mod tests {
    use super::{pure, run, suspend};
    use futures::TryFutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn suspend_is_lazy() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let effect = suspend(move || {
            ran2.store(true, Ordering::Release);
            Ok(20)
        })
        .and_then(|n| pure(n + 1))
        .map_ok(|n| n * 2);
        assert!(!ran.load(Ordering::Acquire));
        assert_eq!(run(effect).unwrap(), 42);
        assert!(ran.load(Ordering::Acquire));
    }
}
