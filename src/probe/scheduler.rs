//! Fixed-interval, bounded-duration cycle scheduling.
//!
//! One loop selects over the cancellation token, the duration deadline, the
//! cycle ticker and finished cycle tasks. Each tick spawns a cycle into a
//! [`JoinSet`]; whatever is still in flight when the loop ends is drained
//! before [`CycleScheduler::run`] returns.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Why the scheduler stopped starting cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The configured duration elapsed.
    Deadline,
    /// The token was cancelled.
    Cancelled,
}

/// Outcome of [`CycleScheduler::run`].
#[derive(Debug)]
pub struct ScheduledRun<T> {
    /// Cycle results in completion order.
    pub outcomes: Vec<T>,
    /// Cycles started, including any whose task failed.
    pub started: u64,
    /// Cycle tasks that panicked.
    pub failed: u64,
    pub cause: StopCause,
    /// Time from the first tick to the stop decision.
    pub elapsed: Duration,
}

/// Starts a cycle every `interval` until `duration` elapses or `cancel` fires.
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    interval: Duration,
    duration: Duration,
    cancel: CancellationToken,
}

impl CycleScheduler {
    pub fn new(interval: Duration, duration: Duration, cancel: CancellationToken) -> Self {
        Self {
            // interval_at panics on a zero period.
            interval: interval.max(Duration::from_millis(1)),
            duration,
            cancel,
        }
    }

    /// Run until stopped, then wait for every spawned cycle.
    ///
    /// `spawn_cycle` is called with the cycle index (from 0) and the tick
    /// instant. The first cycle starts immediately. The deadline is checked
    /// before the ticker, so a tick landing exactly on the deadline does not
    /// start a cycle.
    pub async fn run<F, Fut, T>(&self, mut spawn_cycle: F) -> ScheduledRun<T>
    where
        F: FnMut(u64, Instant) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        let deadline = sleep_until(start + self.duration);
        tokio::pin!(deadline);

        let mut ticker = interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::new();
        let mut started: u64 = 0;
        let mut failed: u64 = 0;

        let cause = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break StopCause::Cancelled,
                () = &mut deadline => break StopCause::Deadline,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    collect(joined, &mut outcomes, &mut failed);
                }
                tick = ticker.tick() => {
                    debug!(cycle = started, "Starting cycle");
                    tasks.spawn(spawn_cycle(started, tick));
                    started += 1;
                }
            }
        };
        let elapsed = start.elapsed();

        debug!(in_flight = tasks.len(), ?cause, "Draining cycles");
        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut outcomes, &mut failed);
        }

        ScheduledRun {
            outcomes,
            started,
            failed,
            cause,
            elapsed,
        }
    }
}

fn collect<T>(
    joined: Result<T, tokio::task::JoinError>,
    outcomes: &mut Vec<T>,
    failed: &mut u64,
) {
    match joined {
        Ok(outcome) => outcomes.push(outcome),
        Err(e) => {
            error!(error = %e, "Cycle task failed");
            *failed += 1;
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cycles_until_deadline() {
        let scheduler = CycleScheduler::new(
            Duration::from_millis(1000),
            Duration::from_millis(5000),
            CancellationToken::new(),
        );
        let origin = Instant::now();
        let run = scheduler
            .run(|index, tick| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                (index, tick - origin)
            })
            .await;

        assert_eq!(run.cause, StopCause::Deadline);
        assert_eq!(run.started, 5);
        assert_eq!(run.failed, 0);
        let mut outcomes = run.outcomes;
        outcomes.sort();
        let expected: Vec<_> = (0..5)
            .map(|i| (i, Duration::from_millis(1000 * i)))
            .collect();
        assert_eq!(outcomes, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_in_flight_cycles() {
        let cancel = CancellationToken::new();
        let scheduler = CycleScheduler::new(
            Duration::from_millis(100),
            Duration::from_secs(60),
            cancel.clone(),
        );

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            stopper.cancel();
        });

        // Each cycle outlives the stop request.
        let run = scheduler
            .run(|index, _| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                index
            })
            .await;

        assert_eq!(run.cause, StopCause::Cancelled);
        assert_eq!(run.started, 3);
        assert_eq!(run.outcomes.len(), 3);
        assert_eq!(run.elapsed, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_starts_nothing() {
        let scheduler =
            CycleScheduler::new(Duration::from_secs(1), Duration::ZERO, CancellationToken::new());
        let run = scheduler.run(|index, _| async move { index }).await;
        assert_eq!(run.started, 0);
        assert!(run.outcomes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_is_counted() {
        let scheduler = CycleScheduler::new(
            Duration::from_millis(100),
            Duration::from_millis(250),
            CancellationToken::new(),
        );
        let run = scheduler
            .run(|index, _| async move {
                if index == 1 {
                    panic!("boom");
                }
                index
            })
            .await;
        assert_eq!(run.started, 3);
        assert_eq!(run.failed, 1);
        assert_eq!(run.outcomes.len(), 2);
    }
}
