//! Clock-driven streams.
//!
//! Every stream here takes its clock from an explicit [`Scheduler`], so tests
//! can run against tokio's paused clock or a custom scheduler. Elapsed times
//! are measured from the moment the stream is first pulled.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;

use crate::{Error, Pull, PullContext, Result, Stream};

/// A monotonic clock that can suspend until a deadline.
pub trait Scheduler: Send + Sync + 'static {
    fn now(&self) -> Instant;

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;
}

/// The tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn shared() -> Arc<dyn Scheduler> {
        Arc::new(Self)
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        tokio::time::sleep_until(deadline).boxed()
    }
}

fn check_period(period: Duration) -> Result<()> {
    if period.is_zero() {
        return Err(Error::InvalidConfig(
            "period must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

async fn awake_loop(
    ctx: PullContext<Duration>,
    scheduler: Arc<dyn Scheduler>,
    period: Duration,
) -> Result<()> {
    let start = scheduler.now();
    let mut deadline = start + period;
    loop {
        if scheduler.now() < deadline {
            scheduler.sleep_until(deadline).await;
        }
        ctx.output1(scheduler.now() - start).await;

        // Ticks are laid on a fixed grid from `start`; ticks missed by a
        // slow consumer are skipped rather than queued.
        let now = scheduler.now();
        deadline += period;
        while deadline <= now {
            deadline += period;
        }
    }
}

/// Emits the elapsed time at every multiple of `period` since the stream
/// started.
///
/// The n-th tick is scheduled at `start + n * period` regardless of when the
/// previous tick was consumed, so lateness never accumulates.
pub fn awake_every(scheduler: Arc<dyn Scheduler>, period: Duration) -> Stream<Duration> {
    if let Err(error) = check_period(period) {
        return Stream::fail(error);
    }
    Pull::from_fn(move |ctx| awake_loop(ctx, scheduler, period)).stream()
}

async fn duration_loop(ctx: PullContext<Duration>, scheduler: Arc<dyn Scheduler>) -> Result<()> {
    let start = scheduler.now();
    loop {
        ctx.output1(scheduler.now() - start).await;
    }
}

/// Emits, on every pull, the time elapsed since the stream was first pulled.
pub fn duration(scheduler: Arc<dyn Scheduler>) -> Stream<Duration> {
    Pull::from_fn(move |ctx| duration_loop(ctx, scheduler)).stream()
}

async fn every_loop(
    ctx: PullContext<(Duration, bool)>,
    scheduler: Arc<dyn Scheduler>,
    period: Duration,
) -> Result<()> {
    let start = scheduler.now();
    let mut last_true: Option<Duration> = None;
    loop {
        let elapsed = scheduler.now() - start;
        let due = match last_true {
            None => true,
            Some(last) => elapsed - last >= period,
        };
        if due {
            last_true = Some(elapsed);
        }
        ctx.output1((elapsed, due)).await;
    }
}

/// Like [`every`], pairing each flag with the elapsed time at which it was
/// computed.
pub fn every_timed(scheduler: Arc<dyn Scheduler>, period: Duration) -> Stream<(Duration, bool)> {
    if let Err(error) = check_period(period) {
        return Stream::fail(error);
    }
    Pull::from_fn(move |ctx| every_loop(ctx, scheduler, period)).stream()
}

/// Emits `true` on a pull if at least `period` has passed since the last
/// `true`, and `false` otherwise. The first element is always `true`.
pub fn every(scheduler: Arc<dyn Scheduler>, period: Duration) -> Stream<bool> {
    let timed = every_timed(scheduler, period);
    Pull::from_fn(move |ctx| async move {
        let upstream = ctx.consume(timed);
        while let Some(chunk) = upstream.pull().await? {
            ctx.output(chunk.iter().map(|(_, due)| *due).collect()).await;
        }
        Ok(())
    })
    .stream()
}

/// Emits a single `()` once `delay` has passed.
pub fn sleep(scheduler: Arc<dyn Scheduler>, delay: Duration) -> Stream<()> {
    Pull::from_fn(move |ctx| async move {
        let deadline = scheduler.now() + delay;
        scheduler.sleep_until(deadline).await;
        ctx.output1(()).await;
        Ok(())
    })
    .stream()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{awake_every, duration, every, every_timed, sleep, TokioScheduler};
    use crate::Error;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn awake_every_does_not_drift() {
        let ticks = awake_every(TokioScheduler::shared(), ms(100))
            .take(5)
            .to_vec()
            .await
            .unwrap();
        assert_eq!(ticks, vec![ms(100), ms(200), ms(300), ms(400), ms(500)]);
    }

    #[tokio::test(start_paused = true)]
    async fn awake_every_skips_missed_ticks() {
        let mut ticks = awake_every(TokioScheduler::shared(), ms(100));
        assert_eq!(ticks.pull().await.unwrap().unwrap().to_vec(), vec![ms(100)]);
        tokio::time::sleep(ms(350)).await;
        assert_eq!(ticks.pull().await.unwrap().unwrap().to_vec(), vec![ms(500)]);
        assert_eq!(ticks.pull().await.unwrap().unwrap().to_vec(), vec![ms(600)]);
        ticks.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_rejected() {
        let error = awake_every(TokioScheduler::shared(), Duration::ZERO)
            .to_vec()
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidConfig(_)));
        assert!(every(TokioScheduler::shared(), Duration::ZERO)
            .to_vec()
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_measures_from_first_pull() {
        let mut elapsed = duration(TokioScheduler::shared());
        tokio::time::sleep(ms(1000)).await;
        assert_eq!(elapsed.pull().await.unwrap().unwrap().to_vec(), vec![ms(0)]);
        tokio::time::sleep(ms(250)).await;
        assert_eq!(elapsed.pull().await.unwrap().unwrap().to_vec(), vec![ms(250)]);
    }

    #[tokio::test(start_paused = true)]
    async fn every_flags_period_boundaries() {
        let mut flags = every_timed(TokioScheduler::shared(), ms(100));
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.extend(flags.pull().await.unwrap().unwrap().to_vec());
            tokio::time::sleep(ms(40)).await;
        }
        assert_eq!(seen[0], (ms(0), true));

        let mut last_true = Duration::ZERO;
        for (elapsed, due) in seen.into_iter().skip(1) {
            if due {
                assert!(elapsed - last_true >= ms(100));
                last_true = elapsed;
            } else {
                assert!(elapsed - last_true <= ms(100));
            }
        }
        assert_eq!(last_true, ms(240));
    }

    #[tokio::test(start_paused = true)]
    async fn every_first_flag_is_true() {
        let flags = every(TokioScheduler::shared(), ms(100)).take(3).to_vec().await.unwrap();
        assert_eq!(flags, vec![true, false, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_emits_once() {
        let start = tokio::time::Instant::now();
        let woke = sleep(TokioScheduler::shared(), ms(300)).to_vec().await.unwrap();
        assert_eq!(woke, vec![()]);
        assert_eq!(start.elapsed(), ms(300));
    }
}
