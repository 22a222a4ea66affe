//! Bounded concurrent fan-in.
//!
//! [`join`] runs each input stream on its own task, at most `max_open` at a
//! time, and forwards their chunks through a bounded channel. Coordination
//! goes through two signals: `interrupt` asks every branch to stop, and `open`
//! counts the launcher plus the running branches. A branch closes its stream
//! before it leaves `open`, so `open == 0` means every input has released its
//! resources.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::tokio::TOKIO;
use crate::{Chunk, Data, Error, Pull, Result, Signal, Stream};

/// Shared state of one join.
#[derive(Clone)]
struct JoinState {
    interrupt: Signal<bool>,
    open: Signal<usize>,
    failure: Arc<Mutex<Option<Error>>>,
}

impl JoinState {
    fn new() -> Self {
        Self {
            interrupt: Signal::with_value(false),
            // The launcher counts as one.
            open: Signal::with_value(1),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Keeps the first failure and interrupts every branch.
    fn record(&self, error: Error) {
        {
            let mut failure = self.failure.lock().unwrap();
            if failure.is_none() {
                warn!("join branch failed, interrupting the other branches: {error}");
                *failure = Some(error);
            } else {
                debug!("discarding failure of another join branch: {error}");
            }
        }
        self.interrupt();
    }

    fn interrupt(&self) {
        if let Err(error) = self.interrupt.set(true) {
            debug!("join interrupt signal unavailable: {error}");
        }
    }

    fn enter(&self) {
        self.update_open(|n| n + 1);
    }

    fn leave(&self) {
        self.update_open(|n| n.saturating_sub(1));
    }

    fn update_open(&self, f: impl FnOnce(usize) -> usize) {
        if let Err(error) = self.open.compare_and_set(|n| n.map(|n| f(*n))) {
            debug!("join counter unavailable: {error}");
        }
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().unwrap().take()
    }

    /// Interrupts all branches and waits until each has released its stream.
    async fn shutdown(&self) -> Result<()> {
        self.interrupt();
        wait_until(&self.open, |n| *n == 0).await
    }
}

/// Resolves once `signal` holds a value satisfying `predicate`, or once it
/// closes.
async fn wait_until<A, P>(signal: &Signal<A>, predicate: P) -> Result<()>
where
    A: Clone + PartialEq + Data,
    P: Fn(&A) -> bool,
{
    let mut values = signal.discrete();
    while let Some(chunk) = values.pull().await? {
        if chunk.iter().any(&predicate) {
            break;
        }
    }
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "join branch panicked".to_string()
    }
}

/// Forwards `stream` into `sender` until it ends, fails, the receiver goes
/// away, or the join is interrupted.
async fn forward<O: Data>(
    stream: &mut Stream<O>,
    sender: &mpsc::Sender<Chunk<O>>,
    interrupt: &Signal<bool>,
) -> Result<()> {
    let mut interrupted = pin!(wait_until(interrupt, |stop| *stop));
    loop {
        let chunk = select! {
            biased;
            _ = &mut interrupted => return Ok(()),
            chunk = stream.pull() => chunk?,
        };
        let Some(chunk) = chunk else {
            return Ok(());
        };
        select! {
            biased;
            _ = &mut interrupted => return Ok(()),
            sent = sender.send(chunk) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn run_branch<O: Data>(mut stream: Stream<O>, sender: mpsc::Sender<Chunk<O>>, state: JoinState) {
    let forwarded = AssertUnwindSafe(forward(&mut stream, &sender, &state.interrupt))
        .catch_unwind()
        .await;
    let closed = AssertUnwindSafe(stream.close()).catch_unwind().await;
    let outcome = match (forwarded, closed) {
        (Err(panic), _) | (_, Err(panic)) => Err(Error::Panicked(panic_message(panic))),
        (Ok(Err(error)), _) | (_, Ok(Err(error))) => Err(error),
        (Ok(Ok(())), Ok(Ok(()))) => Ok(()),
    };
    if let Err(error) = outcome {
        state.record(error);
    }
    // The joined stream reads the recorded failure once every sender is gone.
    drop(sender);
    state.leave();
}

async fn launch<O, I>(
    handle: Handle,
    max_open: usize,
    streams: I,
    sender: mpsc::Sender<Chunk<O>>,
    state: JoinState,
) where
    O: Data,
    I: IntoIterator<Item = Stream<O>>,
{
    let permits = Arc::new(Semaphore::new(max_open));
    {
        let mut interrupted = pin!(wait_until(&state.interrupt, |stop| *stop));
        for (index, stream) in streams.into_iter().enumerate() {
            let permit = select! {
                biased;
                _ = &mut interrupted => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            debug!("launching join branch {index}");
            state.enter();
            let sender = sender.clone();
            let state = state.clone();
            handle.spawn(async move {
                run_branch(stream, sender, state).await;
                drop(permit);
            });
        }
    }
    drop(sender);
    state.leave();
}

/// Runs `streams` concurrently on the current tokio runtime, at most
/// `max_open` at a time, and emits their chunks as they become available.
///
/// See [`join_on`].
pub fn join<O, I>(max_open: usize, streams: I) -> Stream<O>
where
    O: Data,
    I: IntoIterator<Item = Stream<O>> + Send + 'static,
    I::IntoIter: Send,
{
    join_with(None, max_open, streams)
}

/// Runs `streams` concurrently on `handle`, at most `max_open` at a time,
/// and emits their chunks as they become available.
///
/// Chunks of one input keep their order; chunks of different inputs
/// interleave arbitrarily. The first failure of any input interrupts the
/// others and becomes the failure of the joined stream once every input has
/// released its resources. Closing the joined stream early stops and releases
/// every input too.
///
/// `max_open` must be at least 1.
pub fn join_on<O, I>(handle: Handle, max_open: usize, streams: I) -> Stream<O>
where
    O: Data,
    I: IntoIterator<Item = Stream<O>> + Send + 'static,
    I::IntoIter: Send,
{
    join_with(Some(handle), max_open, streams)
}

fn join_with<O, I>(handle: Option<Handle>, max_open: usize, streams: I) -> Stream<O>
where
    O: Data,
    I: IntoIterator<Item = Stream<O>> + Send + 'static,
    I::IntoIter: Send,
{
    if max_open == 0 {
        return Stream::fail(Error::InvalidConfig(
            "join requires max_open of at least 1".to_string(),
        ));
    }
    Pull::from_fn(move |ctx| async move {
        let handle = handle
            .or_else(|| Handle::try_current().ok())
            .unwrap_or_else(|| TOKIO.handle().clone());
        let state = JoinState::new();
        let (sender, mut receiver) = mpsc::channel(max_open);

        let stopping = state.clone();
        ctx.on_release(move || async move { stopping.shutdown().await });

        let launcher = launch(handle.clone(), max_open, streams.into_iter(), sender, state.clone());
        handle.spawn(launcher);

        // The channel closes once the launcher and every branch are gone.
        while let Some(chunk) = receiver.recv().await {
            ctx.output(chunk).await;
        }
        match state.take_failure() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    })
    .stream()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::join;
    use crate::test::{init_test_logger, LeakCounter};
    use crate::{Error, Pull, Stream};

    /// Emits `(branch, 0..count)` one element per chunk.
    fn numbered(branch: usize, count: usize) -> Stream<(usize, usize)> {
        Pull::from_fn(move |ctx| async move {
            for n in 0..count {
                ctx.output1((branch, n)).await;
                tokio::task::yield_now().await;
            }
            Ok(())
        })
        .stream()
    }

    fn endless(branch: usize) -> Stream<(usize, usize)> {
        numbered(branch, usize::MAX)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn emits_everything() {
        init_test_logger();
        let streams: Vec<_> = (0..5).map(|branch| numbered(branch, 200)).collect();
        let values = join(5, streams).to_vec().await.unwrap();
        assert_eq!(values.len(), 1000);

        // Each branch keeps its own order.
        let mut per_branch: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (branch, n) in values {
            per_branch.entry(branch).or_default().push(n);
        }
        assert_eq!(per_branch.len(), 5);
        for values in per_branch.values() {
            assert_eq!(*values, (0..200).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn empty_input() {
        let values = join(3, Vec::<Stream<u8>>::new()).to_vec().await.unwrap();
        assert!(values.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn respects_max_open() {
        let counter = LeakCounter::default();
        let peak = Arc::new(AtomicUsize::new(0));
        let streams: Vec<_> = (0..8)
            .map(|branch| {
                let observed = counter.clone();
                let peak = peak.clone();
                counter.bracketed(Pull::from_fn(move |ctx| async move {
                    for n in 0..20 {
                        peak.fetch_max(observed.open(), Ordering::AcqRel);
                        ctx.output1((branch, n)).await;
                        tokio::task::yield_now().await;
                    }
                    Ok(())
                })
                .stream())
            })
            .collect();
        let values = join(3, streams).to_vec().await.unwrap();
        assert_eq!(values.len(), 160);
        assert!(peak.load(Ordering::Acquire) <= 3);
        assert_eq!(counter.acquired(), 8);
        assert_eq!(counter.open(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_failure_releases_everything() {
        init_test_logger();
        let counter = LeakCounter::default();
        let mut streams: Vec<_> = (0..4).map(|branch| counter.bracketed(endless(branch))).collect();
        streams.push(counter.bracketed(
            numbered(4, 10).chain(Stream::fail(Error::msg("branch 4 failed"))),
        ));
        let error = join(5, streams).drain().await.unwrap_err();
        assert_eq!(error.to_string(), "branch 4 failed");
        assert_eq!(counter.open(), 0);
        assert_eq!(counter.released(), counter.acquired());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_failure_surfaces() {
        let streams: Vec<_> = (0..6)
            .map(|branch| Stream::<u32>::fail(Error::msg(format!("branch {branch}"))))
            .collect();
        let error = join(6, streams).drain().await.unwrap_err();
        assert!(error.to_string().starts_with("branch "));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn early_stop_releases_everything() {
        let counter = LeakCounter::default();
        let streams: Vec<_> = (0..4).map(|branch| counter.bracketed(endless(branch))).collect();
        let values = join(2, streams).take(10).to_vec().await.unwrap();
        assert_eq!(values.len(), 10);
        assert_eq!(counter.open(), 0);
    }

    #[tokio::test]
    async fn zero_max_open_is_rejected() {
        let error = join(0, vec![Stream::emit(1)]).to_vec().await.unwrap_err();
        assert!(matches!(error, Error::InvalidConfig(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_branch_fails_the_join() {
        let exploding = Pull::<u32, ()>::from_fn(|_| async move {
            if true {
                panic!("branch exploded");
            }
            Ok(())
        })
        .stream();
        let error = join(2, vec![Stream::emits(vec![1, 2]), exploding])
            .drain()
            .await
            .unwrap_err();
        match error {
            Error::Panicked(message) => assert_eq!(message, "branch exploded"),
            other => panic!("unexpected error {other}"),
        }
    }
}
