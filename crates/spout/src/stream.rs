//! Driving pulls from the consumer side.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::collector::{Collector, VecCollector};
use crate::pull::{PullContext, Scope, Slot};
use crate::tokio::TOKIO;
use crate::{Chunk, Data, Error, Pull, Result};

enum State {
    /// The pull body has not finished.
    Running(BoxFuture<'static, Result<()>>),

    /// The body finished; its resources are being released.
    Releasing {
        release: BoxFuture<'static, Result<()>>,
        failure: Option<Error>,
    },

    Done,
}

/// A stream of chunks produced by a [`Pull`].
///
/// The stream is lazy: nothing runs until the first [`Stream::pull`]. Each
/// call resumes the underlying pull until it emits its next chunk, finishes,
/// or fails. Resources acquired by the pull are released before the stream
/// reports the end or a failure.
///
/// A consumer that stops early should call [`Stream::close`]. A stream dropped
/// while it still holds resources releases them in the background on the
/// current tokio runtime, or synchronously on the shared runtime when dropped
/// outside of one.
pub struct Stream<O> {
    state: State,
    slot: Slot<O>,
    scope: Scope,
}

impl<O: Data> Stream<O> {
    pub fn new(pull: Pull<O, ()>) -> Self {
        let slot: Slot<O> = Arc::new(Mutex::new(None));
        let scope = Scope::new();
        let ctx = PullContext::new(slot.clone(), scope.clone());
        let body = pull.into_body();
        Self {
            state: State::Running(async move { body(ctx).await }.boxed()),
            slot,
            scope,
        }
    }

    pub fn empty() -> Self {
        Pull::done(()).stream()
    }

    pub fn emit(value: O) -> Self {
        Pull::output1(value).stream()
    }

    pub fn emits(values: Vec<O>) -> Self {
        Pull::output(Chunk::from(values)).stream()
    }

    pub fn chunk(chunk: Chunk<O>) -> Self {
        Pull::output(chunk).stream()
    }

    /// A stream emitting the single result of `effect`.
    pub fn eval<Fut>(effect: Fut) -> Self
    where
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Pull::eval(effect).flat_map(Pull::output1).stream()
    }

    pub fn fail(error: Error) -> Self {
        Pull::fail(error).stream()
    }

    /// Acquires a resource, streams `body(resource)`, and releases the
    /// resource once that stream ends, fails, or is closed by the consumer.
    pub fn bracket<T, Mk, Use, Rel, RelFut>(make: Mk, body: Use, release: Rel) -> Self
    where
        T: Clone + Send + 'static,
        Mk: Future<Output = Result<T>> + Send + 'static,
        Use: FnOnce(T) -> Stream<O> + Send + 'static,
        Rel: FnOnce(T) -> RelFut + Send + 'static,
        RelFut: Future<Output = Result<()>> + Send + 'static,
    {
        Pull::from_fn(move |ctx| async move {
            let resource = ctx.acquire(make, release).await?;
            let inner = ctx.consume(body(resource));
            while let Some(chunk) = inner.pull().await? {
                ctx.output(chunk).await;
            }
            Ok(())
        })
        .stream()
    }

    /// Re-emits this stream's output inside another pull.
    pub fn into_pull(self) -> Pull<O, ()> {
        Pull::from_fn(move |ctx| async move {
            let upstream = ctx.consume(self);
            while let Some(chunk) = upstream.pull().await? {
                ctx.output(chunk).await;
            }
            Ok(())
        })
    }

    /// Emits this stream's output followed by `next`'s.
    pub fn chain(self, next: Stream<O>) -> Self {
        self.into_pull().then(next.into_pull()).stream()
    }

    /// Emits at most `n` elements, then closes this stream.
    pub fn take(self, n: usize) -> Self {
        Pull::from_fn(move |ctx| async move {
            let upstream = ctx.consume(self);
            let mut remaining = n;
            while remaining > 0 {
                let Some(chunk) = upstream.pull().await? else {
                    break;
                };
                let chunk = chunk.take(remaining);
                remaining -= chunk.len();
                ctx.output(chunk).await;
            }
            upstream.close().await
        })
        .stream()
    }

    fn poll_pull(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Chunk<O>>>> {
        loop {
            match &mut self.state {
                State::Running(body) => {
                    let polled = body.as_mut().poll(cx);
                    let chunk = self.slot.lock().unwrap().take();
                    match polled {
                        Poll::Pending => {
                            return match chunk {
                                Some(chunk) => Poll::Ready(Ok(Some(chunk))),
                                None => Poll::Pending,
                            }
                        }
                        Poll::Ready(outcome) => {
                            self.state = State::Releasing {
                                release: self.scope.close(0),
                                failure: outcome.err(),
                            };
                            if let Some(chunk) = chunk {
                                return Poll::Ready(Ok(Some(chunk)));
                            }
                        }
                    }
                }
                State::Releasing { release, failure } => {
                    let released = ready!(release.as_mut().poll(cx));
                    let failure = failure.take().or(released.err());
                    self.state = State::Done;
                    return Poll::Ready(match failure {
                        Some(error) => Err(error),
                        None => Ok(None),
                    });
                }
                State::Done => return Poll::Ready(Ok(None)),
            }
        }
    }

    /// Runs the stream until it emits its next chunk.
    ///
    /// Returns `Ok(None)` once the stream is exhausted and its resources are
    /// released. A failure is returned only after release, too.
    pub async fn pull(&mut self) -> Result<Option<Chunk<O>>> {
        poll_fn(|cx| self.poll_pull(cx)).await
    }

    /// Stops the stream early and releases its resources.
    pub async fn close(mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Running(body) => {
                drop(body);
                self.scope.close(0).await
            }
            State::Releasing { release, failure } => {
                let released = release.await;
                match failure {
                    Some(error) => Err(error),
                    None => released,
                }
            }
            State::Done => Ok(()),
        }
    }

    /// Folds every chunk into `collector`.
    pub async fn collect_with<C>(mut self, mut collector: C) -> Result<C::Output>
    where
        C: Collector<O>,
    {
        while let Some(chunk) = self.pull().await? {
            collector.add(&chunk);
        }
        Ok(collector.result())
    }

    pub async fn to_vec(self) -> Result<Vec<O>>
    where
        O: Clone,
    {
        self.collect_with(VecCollector::default()).await
    }

    /// Runs the stream to completion, discarding its output.
    pub async fn drain(mut self) -> Result<()> {
        while self.pull().await?.is_some() {}
        Ok(())
    }
}

impl<O: Data> futures::Stream for Stream<O> {
    type Item = Result<Chunk<O>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(self.get_mut().poll_pull(cx)) {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(None) => Poll::Ready(None),
            Err(error) => Poll::Ready(Some(Err(error))),
        }
    }
}

impl<O> Drop for Stream<O> {
    fn drop(&mut self) {
        let release = match std::mem::replace(&mut self.state, State::Done) {
            State::Running(body) => {
                drop(body);
                if self.scope.is_empty() {
                    return;
                }
                self.scope.close(0)
            }
            State::Releasing { release, .. } => release,
            State::Done => return,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("stream dropped before completion, releasing its resources in the background");
                handle.spawn(async move {
                    if let Err(error) = release.await {
                        warn!("failed to release resources of a dropped stream: {error}");
                    }
                });
            }
            Err(_) => {
                if let Err(error) = TOKIO.block_on(release) {
                    warn!("failed to release resources of a dropped stream: {error}");
                }
            }
        }
    }
}
