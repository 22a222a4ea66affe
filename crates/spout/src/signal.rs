//! A concurrently shared, asynchronously settable cell.
//!
//! A [`Signal`] holds an optional value (absent until first set) and moves
//! through the states
//!
//! ```text
//! Uninitialized -> Set(a) -> Set(a') -> ... -> Closed | Failed(e)
//! ```
//!
//! with `Closed` and `Failed` also reachable directly from `Uninitialized`.
//! Every mutation is a [`Msg`] applied under the signal's lock, so updates
//! are linearizable and readers never observe an intermediate state.
//! Because mutations never suspend, `close` and `fail` find no mutation in
//! flight; callers suspended in [`Signal::get`] are resolved before `close`
//! or `fail` returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{Data, Error, Pull, Result, Stream};

/// A value transition reported by [`Signal::modify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change<A> {
    pub previous: A,
    pub now: A,
}

impl<A: PartialEq> Change<A> {
    pub fn modified(&self) -> bool {
        self.previous != self.now
    }
}

enum Terminal {
    Closed,
    Failed(Error),
}

enum Event<A> {
    Value(A),
    Failed(Error),
}

/// Mutation requests.
enum Msg<'a, A> {
    /// Replace the value, notifying observers if it changed.
    Set(A),

    /// Replace the value with the function's result, unless it returns
    /// `None` or the current value.
    CompareAndSet(Box<dyn FnOnce(Option<&A>) -> Option<A> + 'a>),

    /// Notify observers of the current value without changing it.
    Refresh,
}

struct State<A> {
    value: Option<A>,
    terminal: Option<Terminal>,

    /// Callers of `get` waiting for the first value.
    getters: Vec<oneshot::Sender<Result<A>>>,

    /// Discrete observers.
    subscribers: Vec<mpsc::UnboundedSender<Event<A>>>,
}

impl<A: Clone> State<A> {
    fn check(&self) -> Result<()> {
        match &self.terminal {
            None => Ok(()),
            Some(Terminal::Closed) => Err(Error::EndOfSignal),
            Some(Terminal::Failed(error)) => Err(error.clone()),
        }
    }

    fn publish(&mut self, value: &A) {
        for getter in self.getters.drain(..) {
            let _ = getter.send(Ok(value.clone()));
        }
        self.subscribers
            .retain(|subscriber| subscriber.send(Event::Value(value.clone())).is_ok());
    }
}

/// A shared cell with atomic compare-and-set and closed/failed terminal
/// states.
///
/// Cloning a signal yields another handle to the same cell.
pub struct Signal<A> {
    state: Arc<Mutex<State<A>>>,
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A: Clone + PartialEq> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Clone + PartialEq> Signal<A> {
    /// Creates an uninitialized signal.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                value: None,
                terminal: None,
                getters: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn with_value(value: A) -> Self {
        let signal = Self::new();
        signal.lock().value = Some(value);
        signal
    }

    /// The state is only written after a compare-and-set function returns,
    /// so a panic in that function leaves it consistent.
    fn lock(&self) -> MutexGuard<'_, State<A>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `msg`, returning the value before and after.
    fn apply(&self, msg: Msg<'_, A>) -> Result<(Option<A>, Option<A>)> {
        let mut state = self.lock();
        state.check()?;
        let previous = state.value.clone();
        let (next, notify) = match msg {
            Msg::Set(value) => {
                let changed = previous.as_ref() != Some(&value);
                (Some(value), changed)
            }
            Msg::CompareAndSet(f) => match f(previous.as_ref()) {
                Some(value) => {
                    let changed = previous.as_ref() != Some(&value);
                    (Some(value), changed)
                }
                None => (previous.clone(), false),
            },
            Msg::Refresh => (previous.clone(), previous.is_some()),
        };
        if notify {
            if let Some(value) = &next {
                state.value = Some(value.clone());
                state.publish(value);
            }
        }
        Ok((previous, next))
    }

    /// Returns the current value, suspending until one is set.
    ///
    /// Fails with [`Error::EndOfSignal`] if the signal is closed, including
    /// while waiting, and with the stored error if the signal failed.
    pub async fn get(&self) -> Result<A> {
        let receiver = {
            let mut state = self.lock();
            state.check()?;
            if let Some(value) = &state.value {
                return Ok(value.clone());
            }
            let (sender, receiver) = oneshot::channel();
            state.getters.push(sender);
            receiver
        };
        receiver.await.unwrap_or(Err(Error::EndOfSignal))
    }

    /// Returns the current value without suspending.
    pub fn current(&self) -> Result<Option<A>> {
        let state = self.lock();
        state.check()?;
        Ok(state.value.clone())
    }

    /// Replaces the value. Like [`Signal::compare_and_set`], observers are
    /// notified only if the value changed.
    pub fn set(&self, value: A) -> Result<()> {
        self.apply(Msg::Set(value)).map(|_| ())
    }

    /// Replaces the value, returning the previous one.
    pub fn get_and_set(&self, value: A) -> Result<Option<A>> {
        self.apply(Msg::Set(value)).map(|(previous, _)| previous)
    }

    /// Atomically replaces the value with `f(current)` and returns the
    /// resulting value.
    ///
    /// Observers are notified only if the value changed, compared by
    /// equality. Returning `None` leaves the signal untouched.
    pub fn compare_and_set<F>(&self, f: F) -> Result<Option<A>>
    where
        F: FnOnce(Option<&A>) -> Option<A>,
    {
        self.apply(Msg::CompareAndSet(Box::new(f)))
            .map(|(_, next)| next)
    }

    /// Waits for a value, then atomically applies `f` to it.
    pub async fn modify<F>(&self, f: F) -> Result<Change<A>>
    where
        F: FnOnce(&A) -> A,
    {
        self.get().await?;
        let (previous, now) =
            self.apply(Msg::CompareAndSet(Box::new(|current: Option<&A>| current.map(f))))?;
        match (previous, now) {
            (Some(previous), Some(now)) => Ok(Change { previous, now }),
            // A set signal never becomes unset again.
            _ => Err(Error::EndOfSignal),
        }
    }

    /// Notifies discrete observers of the current value even though it did
    /// not change. A no-op while the signal is unset.
    pub fn refresh(&self) -> Result<()> {
        self.apply(Msg::Refresh).map(|_| ())
    }

    /// Closes the signal. Subsequent operations fail with
    /// [`Error::EndOfSignal`] and discrete streams end.
    ///
    /// Does nothing if the signal already closed or failed.
    pub fn close(&self) -> Result<()> {
        self.terminate(Terminal::Closed);
        Ok(())
    }

    /// Fails the signal with `error`, which every pending and subsequent
    /// operation then returns. Failing with [`Error::EndOfSignal`] closes it.
    ///
    /// Does nothing if the signal already closed or failed.
    pub fn fail(&self, error: Error) -> Result<()> {
        let terminal = match error {
            Error::EndOfSignal => Terminal::Closed,
            error => Terminal::Failed(error),
        };
        self.terminate(terminal);
        Ok(())
    }

    fn terminate(&self, terminal: Terminal) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }
        let error = match &terminal {
            Terminal::Closed => Error::EndOfSignal,
            Terminal::Failed(error) => error.clone(),
        };
        debug!("signal terminated: {error}");
        for getter in state.getters.drain(..) {
            let _ = getter.send(Err(error.clone()));
        }
        for subscriber in state.subscribers.drain(..) {
            if let Terminal::Failed(error) = &terminal {
                let _ = subscriber.send(Event::Failed(error.clone()));
            }
        }
        state.terminal = Some(terminal);
    }

    /// Returns true once the signal is closed or failed.
    pub fn is_closed(&self) -> bool {
        self.lock().terminal.is_some()
    }

    /// Registers a discrete observer, seeded with the current value.
    ///
    /// Returns `None` if the signal is closed.
    fn subscribe(&self) -> Result<Option<mpsc::UnboundedReceiver<Event<A>>>> {
        let mut state = self.lock();
        match state.check() {
            Err(Error::EndOfSignal) => return Ok(None),
            Err(error) => return Err(error),
            Ok(()) => (),
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(value) = &state.value {
            let _ = sender.send(Event::Value(value.clone()));
        }
        state.subscribers.push(sender);
        Ok(Some(receiver))
    }
}

impl<A: Clone + PartialEq + Data> Signal<A> {
    /// A stream of the current value followed by every subsequent
    /// transition, each emitted exactly once.
    ///
    /// The stream ends when the signal closes and fails when it fails.
    pub fn discrete(&self) -> Stream<A> {
        let signal = self.clone();
        Pull::from_fn(move |ctx| async move {
            let Some(mut events) = signal.subscribe()? else {
                return Ok(());
            };
            while let Some(event) = events.recv().await {
                match event {
                    Event::Value(value) => ctx.output1(value).await,
                    Event::Failed(error) => return Err(error),
                }
            }
            Ok(())
        })
        .stream()
    }

    /// A stream that yields the current value each time it is pulled.
    ///
    /// Suspends only until the first value is set.
    pub fn continuous(&self) -> Stream<A> {
        let signal = self.clone();
        Pull::from_fn(move |ctx| async move {
            loop {
                match signal.get().await {
                    Ok(value) => ctx.output1(value).await,
                    Err(Error::EndOfSignal) => return Ok(()),
                    Err(error) => return Err(error),
                }
            }
        })
        .stream()
    }

    /// A stream emitting `()` on every transition.
    pub fn changes(&self) -> Stream<()> {
        let signal = self.clone();
        Pull::from_fn(move |ctx| async move {
            let Some(mut events) = signal.subscribe()? else {
                return Ok(());
            };
            while let Some(event) = events.recv().await {
                match event {
                    Event::Value(_) => ctx.output1(()).await,
                    Event::Failed(error) => return Err(error),
                }
            }
            Ok(())
        })
        .stream()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::Signal;
    use crate::Error;

    #[tokio::test]
    async fn get_waits_for_first_value() {
        let signal = Signal::new();
        let reader = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());
        signal.set(5).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), 5);
        assert_eq!(signal.get().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn get_and_set() {
        let signal = Signal::new();
        assert_eq!(signal.get_and_set(1).unwrap(), None);
        assert_eq!(signal.get_and_set(2).unwrap(), Some(1));
        assert_eq!(signal.current().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn compare_and_set_skips_identical_values() {
        let signal = Signal::with_value(1);
        let mut changes = signal.changes();
        // The current value seeds the subscription.
        assert!(changes.pull().await.unwrap().is_some());

        assert_eq!(signal.compare_and_set(|v| v.copied()).unwrap(), Some(1));
        assert_eq!(signal.compare_and_set(|_| None).unwrap(), Some(1));
        assert_eq!(signal.compare_and_set(|v| v.map(|v| v + 1)).unwrap(), Some(2));
        signal.close().unwrap();

        // Only the actual transition was published.
        let rest = changes.to_vec().await.unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn refresh_notifies_without_change() {
        let signal = Signal::new();
        signal.refresh().unwrap();
        assert_eq!(signal.current().unwrap(), None);
        signal.set("a").unwrap();
        let mut discrete = signal.discrete();
        assert_eq!(discrete.pull().await.unwrap().unwrap().to_vec(), vec!["a"]);
        signal.refresh().unwrap();
        signal.set("b").unwrap();
        signal.close().unwrap();
        assert_eq!(discrete.to_vec().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn discrete_emits_every_transition() {
        let signal = Signal::with_value(0);
        let mut discrete = signal.discrete();
        assert_eq!(discrete.pull().await.unwrap().unwrap().to_vec(), vec![0]);
        for n in 1..=5 {
            signal.set(n).unwrap();
        }
        signal.close().unwrap();
        let mut seen = Vec::new();
        while let Some(chunk) = discrete.pull().await.unwrap() {
            seen.extend(chunk.to_vec());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn set_skips_identical_values() {
        let signal = Signal::with_value(1);
        let mut discrete = signal.discrete();
        assert_eq!(discrete.pull().await.unwrap().unwrap().to_vec(), vec![1]);
        signal.set(1).unwrap();
        assert_eq!(signal.get_and_set(1).unwrap(), Some(1));
        signal.set(2).unwrap();
        signal.set(2).unwrap();
        signal.close().unwrap();
        assert_eq!(discrete.to_vec().await.unwrap(), vec![2]);
    }

    #[test]
    fn panicking_update_leaves_signal_usable() {
        let signal = Signal::with_value(7);
        let panicked = std::panic::catch_unwind(AssertUnwindSafe(|| {
            signal.compare_and_set(|_| panic!("update exploded"))
        }));
        assert!(panicked.is_err());

        assert_eq!(signal.current().unwrap(), Some(7));
        signal.set(8).unwrap();
        assert_eq!(
            signal.compare_and_set(|n| n.map(|n| n + 1)).unwrap(),
            Some(9)
        );
        signal.close().unwrap();
        assert!(signal.current().unwrap_err().is_end_of_signal());
    }

    #[tokio::test]
    async fn continuous_yields_current_value() {
        let signal = Signal::with_value(1);
        let mut continuous = signal.continuous();
        assert_eq!(continuous.pull().await.unwrap().unwrap().to_vec(), vec![1]);
        assert_eq!(continuous.pull().await.unwrap().unwrap().to_vec(), vec![1]);
        signal.set(2).unwrap();
        assert_eq!(continuous.pull().await.unwrap().unwrap().to_vec(), vec![2]);
        signal.close().unwrap();
        assert_eq!(continuous.pull().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let signal = Signal::with_value(0usize);
        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        signal.compare_and_set(|n| n.map(|n| n + 1)).unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(signal.get().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn modify_reports_change() {
        let signal = Signal::with_value(10);
        let change = signal.modify(|n| n * 2).await.unwrap();
        assert_eq!((change.previous, change.now), (10, 20));
        assert!(change.modified());
        assert!(!signal.modify(|n| *n).await.unwrap().modified());
    }

    #[tokio::test]
    async fn close_resolves_pending_getters() {
        let signal: Signal<u32> = Signal::new();
        let reader = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.get().await })
        };
        tokio::task::yield_now().await;
        signal.close().unwrap();
        assert!(reader.await.unwrap().unwrap_err().is_end_of_signal());
    }

    #[tokio::test]
    async fn closed_signal_rejects_operations() {
        let signal = Signal::with_value(1);
        signal.close().unwrap();
        assert!(signal.get().await.unwrap_err().is_end_of_signal());
        assert!(signal.set(2).unwrap_err().is_end_of_signal());
        assert!(signal
            .compare_and_set(|_| Some(3))
            .unwrap_err()
            .is_end_of_signal());
        // Terminal operations are idempotent and never fail.
        signal.close().unwrap();
        signal.fail(Error::Timeout).unwrap();
        assert!(signal.get().await.unwrap_err().is_end_of_signal());
        assert_eq!(signal.discrete().to_vec().await.unwrap(), Vec::<i32>::new());
    }

    #[tokio::test]
    async fn failed_signal_returns_stored_error() {
        let signal: Signal<u32> = Signal::new();
        let pending = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.get().await })
        };
        let mut discrete = signal.discrete();
        let error = Error::msg("broken");
        tokio::task::yield_now().await;
        signal.fail(error.clone()).unwrap();

        assert!(pending.await.unwrap().unwrap_err().same_as(&error));
        assert!(signal.get().await.unwrap_err().same_as(&error));
        assert!(signal.set(1).unwrap_err().same_as(&error));
        assert!(discrete.pull().await.unwrap_err().same_as(&error));

        signal.close().unwrap();
        assert!(signal.get().await.unwrap_err().same_as(&error));
    }
}
