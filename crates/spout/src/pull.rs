//! Lazy, resource-safe computations that emit chunks.
//!
//! A [`Pull`] is a suspended computation that emits zero or more output
//! chunks before producing a result or failing. Its body receives a
//! [`PullContext`], through which it emits output and acquires resources.
//!
//! Every resource acquired with [`PullContext::acquire`] is registered in the
//! context's [`Scope`]. The scope releases its resources exactly once, in
//! reverse order of acquisition, when it ends: after the body completes, after
//! it fails, or when the consumer stops early. Release always finishes before
//! the consumer observes completion or failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::{Chunk, Data, Error, Result, Stream};

type Finalizer = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Nested frames of release actions.
///
/// Frame 0 belongs to the stream that drives the pull; [`Pull::scope`] opens
/// inner frames that are closed as soon as the scoped pull finishes.
#[derive(Clone)]
pub struct Scope {
    frames: Arc<Mutex<Vec<Vec<Finalizer>>>>,
}

impl Scope {
    pub(crate) fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(vec![Vec::new()])),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<Finalizer>>> {
        self.frames.lock().unwrap()
    }

    /// Opens a new innermost frame and returns its depth.
    pub(crate) fn open(&self) -> usize {
        let mut frames = self.lock();
        frames.push(Vec::new());
        frames.len() - 1
    }

    fn register(&self, finalizer: Finalizer) {
        let mut frames = self.lock();
        match frames.last_mut() {
            Some(frame) => frame.push(finalizer),
            None => frames.push(vec![finalizer]),
        }
    }

    /// Returns true if no release action is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().iter().all(Vec::is_empty)
    }

    /// Number of pending release actions across all frames.
    pub fn pending(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    /// Detaches every frame at `depth` or deeper and returns an effect that
    /// runs their release actions, most recently acquired first.
    ///
    /// All actions run even if some fail; the first failure is reported.
    pub(crate) fn close(&self, depth: usize) -> BoxFuture<'static, Result<()>> {
        let finalizers: Vec<Finalizer> = {
            let mut frames = self.lock();
            if depth < frames.len() {
                frames.drain(depth..).flatten().collect()
            } else {
                Vec::new()
            }
        };
        async move {
            let mut outcome = Ok(());
            for finalizer in finalizers.into_iter().rev() {
                if let Err(error) = finalizer().await {
                    warn!("failed to release resource: {error}");
                    if outcome.is_ok() {
                        outcome = Err(error);
                    }
                }
            }
            outcome
        }
        .boxed()
    }
}

pub(crate) type Slot<O> = Arc<Mutex<Option<Chunk<O>>>>;

/// Handle through which a pull body emits output and acquires resources.
pub struct PullContext<O> {
    slot: Slot<O>,
    scope: Scope,
}

impl<O> Clone for PullContext<O> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl<O: Data> PullContext<O> {
    pub(crate) fn new(slot: Slot<O>, scope: Scope) -> Self {
        Self { slot, scope }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Emits `chunk` and suspends until the consumer has taken it.
    ///
    /// Must be awaited by the pull body itself: the stream driving the pull
    /// resumes it only when the consumer asks for the next chunk.
    pub fn output(&self, chunk: Chunk<O>) -> Emit<'_, O> {
        Emit {
            slot: &self.slot,
            chunk: Some(chunk),
        }
    }

    pub fn output1(&self, value: O) -> Emit<'_, O> {
        self.output(Chunk::singleton(value))
    }

    /// Acquires a resource with `make` and registers `release` in the
    /// current scope.
    ///
    /// `release` runs exactly once, when the innermost enclosing scope ends.
    /// If `make` fails, nothing is registered.
    pub async fn acquire<T, Mk, Rel, RelFut>(&self, make: Mk, release: Rel) -> Result<T>
    where
        T: Clone + Send + 'static,
        Mk: Future<Output = Result<T>>,
        Rel: FnOnce(T) -> RelFut + Send + 'static,
        RelFut: Future<Output = Result<()>> + Send + 'static,
    {
        let resource = make.await?;
        let handle = resource.clone();
        self.scope.register(Box::new(move || release(handle).boxed()));
        Ok(resource)
    }

    /// Registers `release` to run when the innermost enclosing scope ends.
    pub fn on_release<Rel, RelFut>(&self, release: Rel)
    where
        Rel: FnOnce() -> RelFut + Send + 'static,
        RelFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.scope.register(Box::new(move || release().boxed()));
    }

    /// Takes ownership of `stream` for the lifetime of the current scope.
    ///
    /// The upstream is closed when the scope ends unless the body closes it
    /// earlier.
    pub fn consume<P: Data>(&self, stream: Stream<P>) -> Upstream<P> {
        let upstream = Upstream {
            inner: Arc::new(tokio::sync::Mutex::new(Some(stream))),
        };
        let closer = upstream.clone();
        self.on_release(move || async move { closer.close().await });
        upstream
    }
}

/// Future returned by [`PullContext::output`].
pub struct Emit<'a, O> {
    slot: &'a Mutex<Option<Chunk<O>>>,
    chunk: Option<Chunk<O>>,
}

impl<O> Future for Emit<'_, O> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut slot = this.slot.lock().unwrap();
        if slot.is_some() {
            // The consumer has not taken the previous chunk yet.
            return Poll::Pending;
        }
        match this.chunk.take() {
            Some(chunk) if chunk.is_empty() => Poll::Ready(()),
            Some(chunk) => {
                *slot = Some(chunk);
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// A stream owned by a pull body and closed with the body's scope.
pub struct Upstream<P> {
    inner: Arc<tokio::sync::Mutex<Option<Stream<P>>>>,
}

impl<P> Clone for Upstream<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Data> Upstream<P> {
    /// Pulls the next chunk, or `None` once the upstream is exhausted or
    /// closed.
    pub async fn pull(&self) -> Result<Option<Chunk<P>>> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(stream) => stream.pull().await,
            None => Ok(None),
        }
    }

    /// Closes the upstream, releasing its resources. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let stream = self.inner.lock().await.take();
        match stream {
            Some(stream) => stream.close().await,
            None => Ok(()),
        }
    }
}

type Body<O, R> = Box<dyn FnOnce(PullContext<O>) -> BoxFuture<'static, Result<R>> + Send>;

/// A lazy computation emitting chunks of `O` and finally producing `R`.
pub struct Pull<O, R> {
    body: Body<O, R>,
}

impl<O: Data, R: Send + 'static> Pull<O, R> {
    /// Builds a pull from an asynchronous body.
    ///
    /// The body runs only once the resulting stream is pulled. Long or
    /// unbounded pulls are written as loops inside the body.
    pub fn from_fn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(PullContext<O>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self {
            body: Box::new(move |ctx| body(ctx).boxed()),
        }
    }

    pub fn done(result: R) -> Self {
        Self::from_fn(move |_| futures::future::ready(Ok(result)))
    }

    pub fn fail(error: Error) -> Self {
        Self::from_fn(move |_| futures::future::ready(Err(error)))
    }

    /// Evaluates `effect` without emitting anything.
    pub fn eval<Fut>(effect: Fut) -> Self
    where
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self::from_fn(move |_| effect)
    }

    /// Runs this pull inside `ctx`, returning its result.
    pub async fn run(self, ctx: &PullContext<O>) -> Result<R> {
        (self.body)(ctx.clone()).await
    }

    /// Sequences `f` after this pull. If this pull fails, `f` never runs.
    pub fn flat_map<R2, F>(self, f: F) -> Pull<O, R2>
    where
        R2: Send + 'static,
        F: FnOnce(R) -> Pull<O, R2> + Send + 'static,
    {
        Pull::from_fn(move |ctx| async move {
            let result = self.run(&ctx).await?;
            f(result).run(&ctx).await
        })
    }

    pub fn map<R2, F>(self, f: F) -> Pull<O, R2>
    where
        R2: Send + 'static,
        F: FnOnce(R) -> R2 + Send + 'static,
    {
        Pull::from_fn(move |ctx| async move { self.run(&ctx).await.map(f) })
    }

    /// Runs `next` after this pull, discarding this pull's result.
    pub fn then<R2: Send + 'static>(self, next: Pull<O, R2>) -> Pull<O, R2> {
        self.flat_map(move |_| next)
    }

    /// Runs this pull in its own scope.
    ///
    /// Resources acquired inside are released as soon as the pull finishes or
    /// fails, before its result or failure reaches the enclosing pull.
    pub fn scope(self) -> Self {
        Pull::from_fn(move |ctx| async move {
            let depth = ctx.scope.open();
            let result = self.run(&ctx).await;
            let released = ctx.scope.close(depth).await;
            match (result, released) {
                (Err(error), _) => Err(error),
                (Ok(_), Err(error)) => Err(error),
                (Ok(result), Ok(())) => Ok(result),
            }
        })
    }

    /// Recovers from a failure of this pull with the pull returned by `f`.
    ///
    /// Resources acquired by the failed part are released before `f` runs.
    pub fn handle_error_with<F>(self, f: F) -> Self
    where
        F: FnOnce(Error) -> Pull<O, R> + Send + 'static,
    {
        let scoped = self.scope();
        Pull::from_fn(move |ctx| async move {
            match scoped.run(&ctx).await {
                Ok(result) => Ok(result),
                Err(error) => f(error).run(&ctx).await,
            }
        })
    }
}

impl<O: Data, T: Clone + Send + 'static> Pull<O, T> {
    /// Acquires a resource whose release is tied to the enclosing scope.
    pub fn acquire<Mk, Rel, RelFut>(make: Mk, release: Rel) -> Self
    where
        Mk: Future<Output = Result<T>> + Send + 'static,
        Rel: FnOnce(T) -> RelFut + Send + 'static,
        RelFut: Future<Output = Result<()>> + Send + 'static,
    {
        Pull::from_fn(move |ctx| async move { ctx.acquire(make, release).await })
    }
}

impl<O: Data> Pull<O, ()> {
    pub fn output(chunk: Chunk<O>) -> Self {
        Pull::from_fn(move |ctx| async move {
            ctx.output(chunk).await;
            Ok(())
        })
    }

    pub fn output1(value: O) -> Self {
        Self::output(Chunk::singleton(value))
    }

    /// Turns this pull into a stream of its output.
    pub fn stream(self) -> Stream<O> {
        Stream::new(self)
    }
}

impl<O> Pull<O, ()> {
    pub(crate) fn into_body(self) -> Body<O, ()> {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::Pull;
    use crate::test::{init_test_logger, LeakCounter};
    use crate::{Chunk, Error, Stream};

    fn resource(counter: &LeakCounter) -> Pull<i32, usize> {
        let acquire = counter.clone();
        let release = counter.clone();
        Pull::acquire(async move { acquire.acquire() }, move |id| async move {
            release.release(id)
        })
    }

    #[tokio::test]
    async fn flat_map_runs_in_order() {
        let pull = Pull::output(Chunk::from(vec![1, 2]))
            .then(Pull::done(3))
            .flat_map(|n| Pull::output1(n).map(move |_| n * 10));
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        let stream = pull
            .flat_map(move |n| {
                *result2.lock().unwrap() = Some(n);
                Pull::done(())
            })
            .stream();
        assert_eq!(stream.to_vec().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*result.lock().unwrap(), Some(30));
    }

    #[tokio::test]
    async fn release_on_exhaustion() {
        init_test_logger();
        let counter = LeakCounter::default();
        let observed = counter.clone();
        let stream = resource(&counter)
            .flat_map(move |_| {
                assert_eq!(observed.open(), 1);
                Pull::output(Chunk::from(vec![1, 2, 3]))
            })
            .stream();
        assert_eq!(stream.to_vec().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(counter.acquired(), 1);
        assert_eq!(counter.released(), 1);
    }

    #[tokio::test]
    async fn release_on_early_stop() {
        let counter = LeakCounter::default();
        let stream = resource(&counter)
            .flat_map(|_| {
                Pull::from_fn(|ctx| async move {
                    let mut n = 0;
                    loop {
                        ctx.output1(n).await;
                        n += 1;
                        if n == i32::MAX {
                            return Ok(());
                        }
                    }
                })
            })
            .stream();
        assert_eq!(stream.take(5).to_vec().await.unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(counter.open(), 0);
        assert_eq!(counter.released(), 1);
    }

    #[tokio::test]
    async fn release_before_failure_is_observed() {
        for failing_step in 0..4 {
            let counter = LeakCounter::default();
            let observed = counter.clone();
            let mut stream = resource(&counter)
                .flat_map(move |_| {
                    Pull::from_fn(move |ctx| async move {
                        for step in 0..4 {
                            if step == failing_step {
                                return Err(Error::msg(format!("step {step}")));
                            }
                            ctx.output1(step).await;
                        }
                        Ok(())
                    })
                })
                .stream();
            let mut seen = Vec::new();
            let error = loop {
                match stream.pull().await {
                    Ok(Some(chunk)) => seen.extend(chunk.to_vec()),
                    Ok(None) => panic!("expected failure"),
                    Err(error) => break error,
                }
            };
            // Released before the failure became visible.
            assert_eq!(observed.open(), 0);
            assert_eq!(observed.released(), 1);
            assert_eq!(error.to_string(), format!("step {failing_step}"));
            assert_eq!(seen.len(), failing_step as usize);
        }
    }

    #[tokio::test]
    async fn failed_acquire_registers_nothing() {
        let counter = LeakCounter::default();
        let release = counter.clone();
        let stream = Pull::<i32, usize>::acquire(
            async { Err::<usize, _>(Error::msg("cannot open")) },
            move |id| async move { release.release(id) },
        )
        .flat_map(|_| Pull::output1(1))
        .stream();
        assert!(stream.to_vec().await.is_err());
        assert_eq!(counter.released(), 0);
    }

    #[tokio::test]
    async fn scope_releases_before_continuing() {
        let counter = LeakCounter::default();
        let inner = resource(&counter).map(|_| ()).scope();
        let observed = counter.clone();
        let stream = inner
            .flat_map(move |_| {
                // The scoped resource is gone before the next step runs.
                assert_eq!(observed.open(), 0);
                assert_eq!(observed.released(), 1);
                Pull::output1(7)
            })
            .stream();
        assert_eq!(stream.to_vec().await.unwrap(), vec![7]);
        assert_eq!(counter.released(), 1);
    }

    #[tokio::test]
    async fn releases_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut pull: Pull<i32, ()> = Pull::done(());
        for name in ["a", "b", "c"] {
            let order = order.clone();
            pull = pull.then(Pull::acquire(async move { Ok(name) }, move |name| async move {
                order.lock().unwrap().push(name);
                Ok(())
            }))
            .map(|_| ());
        }
        pull.stream().drain().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn handle_error_with_recovers_after_release() {
        let counter = LeakCounter::default();
        let observed = counter.clone();
        let stream = resource(&counter)
            .flat_map(|_| Pull::output1(1).then(Pull::fail(Error::msg("boom"))))
            .handle_error_with(move |error| {
                assert_eq!(error.to_string(), "boom");
                assert_eq!(observed.open(), 0);
                Pull::output1(2)
            })
            .stream();
        assert_eq!(stream.to_vec().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn release_failure_surfaces_after_all_releases() {
        let counter = LeakCounter::default();
        let release = counter.clone();
        let stream = resource(&counter)
            .then(Pull::acquire(async { Ok(()) }, |_| async {
                Err(Error::msg("release failed"))
            }))
            .then(Pull::output1(1))
            .stream();
        let error = stream.to_vec().await.unwrap_err();
        assert_eq!(error.to_string(), "release failed");
        assert_eq!(release.released(), 1);
    }

    #[test]
    fn dropped_stream_releases_outside_runtime() {
        let counter = LeakCounter::default();
        let mut stream: Stream<i32> = resource(&counter)
            .flat_map(|_| Pull::output(Chunk::from(vec![1, 2])).then(Pull::output1(3)))
            .stream();
        let first = crate::effect::run(async { stream.pull().await }).unwrap();
        assert_eq!(first.unwrap().to_vec(), vec![1, 2]);
        assert_eq!(counter.open(), 1);
        drop(stream);
        assert_eq!(counter.open(), 0);
    }
}
