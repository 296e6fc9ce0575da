//! Shared telemetry state
//!
//! One [`TelemetrySnapshot`] per run, written by the two samplers and the
//! benchmark driver, read by the CSV writer. All access goes through a
//! `parking_lot::Mutex`; its guard is `!Send`, so it cannot be held across an
//! `.await` inside a spawned task.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The shared record. Unset readings are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub gpu_power_watts: Option<f64>,
    pub total_power_watts: Option<f64>,
    pub benchmark_running: bool,
    pub atom_count: Option<u64>,
    pub throughput_steps_per_sec: Option<f64>,
}

/// Cloneable handle to the shared record.
#[derive(Debug, Clone, Default)]
pub struct TelemetryState {
    inner: Arc<Mutex<TelemetrySnapshot>>,
}

impl TelemetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the record.
    ///
    /// `f` must only touch memory; do all I/O before calling this.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut TelemetrySnapshot) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Consistent copy of the whole record.
    pub fn read_snapshot(&self) -> TelemetrySnapshot {
        *self.inner.lock()
    }

    pub fn set_gpu_power(&self, watts: f64) {
        self.with_lock(|s| s.gpu_power_watts = Some(watts));
    }

    pub fn set_total_power(&self, watts: f64) {
        self.with_lock(|s| s.total_power_watts = Some(watts));
    }

    /// Mark a configuration as started with `atoms` particles.
    pub fn begin_configuration(&self, atoms: u64) {
        self.with_lock(|s| {
            s.benchmark_running = true;
            s.atom_count = Some(atoms);
        });
    }

    /// Publish a configuration's throughput and mark the benchmark idle.
    pub fn finish_configuration(&self, steps_per_sec: f64) {
        self.with_lock(|s| {
            s.benchmark_running = false;
            s.atom_count = None;
            s.throughput_steps_per_sec = Some(steps_per_sec);
        });
    }

    /// Mark the benchmark idle without publishing a throughput.
    pub fn abandon_configuration(&self) {
        self.with_lock(|s| {
            s.benchmark_running = false;
            s.atom_count = None;
        });
    }
}
