//! Periodic power samplers.
//!
//! A sampler reads its [`PowerSource`] once per tick on the blocking pool and
//! stores the reading in the shared state. Errors are logged and the previous
//! reading stays in place.

use crate::power::PowerSource;
use crate::shutdown::ShutdownSignal;
use crate::snapshot::TelemetryState;
use crate::ticker::Ticker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which snapshot field a sampler feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Gpu,
    Total,
}

impl Channel {
    fn store(self, state: &TelemetryState, watts: f64) {
        match self {
            Channel::Gpu => state.set_gpu_power(watts),
            Channel::Total => state.set_total_power(watts),
        }
    }
}

/// Counters reported when a sampler stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplerStats {
    pub ticks: u64,
    pub readings: u64,
    pub failures: u64,
}

pub struct Sampler {
    source: Arc<dyn PowerSource>,
    channel: Channel,
    period: Duration,
}

impl Sampler {
    pub fn new(source: Arc<dyn PowerSource>, channel: Channel, period: Duration) -> Self {
        Self {
            source,
            channel,
            period,
        }
    }

    /// GPU sampler, feeding `gpu_power_watts`.
    pub fn gpu(source: Arc<dyn PowerSource>, period: Duration) -> Self {
        Self::new(source, Channel::Gpu, period)
    }

    /// Wall-socket sampler, feeding `total_power_watts`.
    pub fn total(source: Arc<dyn PowerSource>, period: Duration) -> Self {
        Self::new(source, Channel::Total, period)
    }

    /// Sample until `shutdown` is raised.
    pub async fn run(self, state: TelemetryState, shutdown: ShutdownSignal) -> SamplerStats {
        let readings = Arc::new(AtomicU64::new(0));
        let failures = Arc::new(AtomicU64::new(0));
        let name = self.source.name().to_string();
        info!(source = %name, channel = ?self.channel, period = ?self.period, "sampler started");

        let ticks = Ticker::new(self.period)
            .run(&shutdown, |tick| {
                let source = Arc::clone(&self.source);
                let state = state.clone();
                let readings = Arc::clone(&readings);
                let failures = Arc::clone(&failures);
                let channel = self.channel;
                let name = name.clone();
                async move {
                    let reading = tokio::task::spawn_blocking(move || source.read_watts()).await;
                    match reading {
                        Ok(Ok(watts)) => {
                            channel.store(&state, watts);
                            readings.fetch_add(1, Ordering::Relaxed);
                            debug!(source = %name, tick, watts, "sample");
                        }
                        Ok(Err(e)) => {
                            failures.fetch_add(1, Ordering::Relaxed);
                            warn!(source = %name, tick, error = %e, "sample failed, keeping previous value");
                        }
                        Err(e) => {
                            failures.fetch_add(1, Ordering::Relaxed);
                            warn!(source = %name, tick, error = %e, "sampler task panicked, keeping previous value");
                        }
                    }
                }
            })
            .await;

        let stats = SamplerStats {
            ticks,
            readings: readings.load(Ordering::Relaxed),
            failures: failures.load(Ordering::Relaxed),
        };
        info!(source = %name, ticks = stats.ticks, failures = stats.failures, "sampler stopped");
        stats
    }
}
