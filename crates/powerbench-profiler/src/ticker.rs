//! Drift-free periodic scheduling.
//!
//! Tick `i` targets `start + i * period`. The target never depends on when the
//! previous tick actually finished, so slow ticks make the next tick late but
//! do not shift the rest of the schedule.

use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Absolute-target periodic trigger.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    start: Instant,
    period: Duration,
}

impl Ticker {
    /// Schedule anchored at the current instant.
    pub fn new(period: Duration) -> Self {
        Self::starting_at(Instant::now(), period)
    }

    pub fn starting_at(start: Instant, period: Duration) -> Self {
        Self { start, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Target instant of tick `index`.
    pub fn scheduled(&self, index: u64) -> Instant {
        let nanos = self.period.as_nanos().saturating_mul(u128::from(index));
        self.start + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Call `action(i)` for `i = 0, 1, 2, ...` until `shutdown` is raised.
    ///
    /// The signal is checked before every tick and watched during every
    /// sleep; a tick that has started always runs to completion. Returns the
    /// number of ticks executed.
    pub async fn run<F, Fut>(&self, shutdown: &ShutdownSignal, mut action: F) -> u64
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut index = 0u64;
        loop {
            if shutdown.is_raised() {
                break;
            }

            action(index).await;
            index += 1;

            let next = self.scheduled(index);
            let now = Instant::now();
            if next > now {
                tokio::select! {
                    biased;
                    _ = shutdown.raised() => break,
                    _ = tokio::time::sleep_until(next) => {}
                }
            } else {
                trace!(tick = index - 1, late_by = ?(now - next), "tick overran its slot");
            }
        }
        index
    }
}
