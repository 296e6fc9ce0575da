//! Workload calibration
//!
//! Step count is a poor proxy for wall time across system sizes and
//! backends, so each configuration is run, timed, and rescaled until one run
//! lands in `[target, max_overshoot * target]`.
//!
//! The controller keeps a single work constant `C` (atom-steps per run) that
//! carries over from one configuration to the next; a configuration with
//! `N` atoms is run for `C / N` steps. After a run of `s` steps taking `t`
//! seconds the constant becomes `s * N * 2 * target / t`, aiming the next
//! run at twice the target.
//!
//! For an engine whose wall time is proportional to step count this
//! accepts within two iterations from any seed: the second run takes
//! `2 * target` (less at most one step lost to rounding). Engines with a
//! fixed per-run overhead converge geometrically; `max_iterations` bounds
//! the loop either way.

use crate::error::CalibrationError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Anything that reports how long it took.
pub trait Timed {
    fn elapsed(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Shortest acceptable run
    pub target: Duration,
    /// Initial work constant in atom-steps
    pub seed: f64,
    /// Runs longer than `max_overshoot * target` are rescaled and repeated
    pub max_overshoot: f64,
    pub max_iterations: u32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            target: Duration::from_secs(10),
            seed: 1e7,
            max_overshoot: 4.0,
            max_iterations: 8,
        }
    }
}

/// Accepted run of a configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibrated<T> {
    pub steps: u64,
    pub elapsed: Duration,
    pub iterations: u32,
    pub run: T,
}

impl<T> Calibrated<T> {
    pub fn steps_per_sec(&self) -> f64 {
        self.steps as f64 / self.elapsed.as_secs_f64()
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationController {
    settings: CalibrationSettings,
    work: f64,
}

impl CalibrationController {
    pub fn new(settings: CalibrationSettings) -> Self {
        Self {
            work: settings.seed,
            settings,
        }
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    /// Current work constant in atom-steps.
    pub fn work_constant(&self) -> f64 {
        self.work
    }

    /// Steps to run next for a system of `atoms` atoms (at least one).
    pub fn steps_for(&self, atoms: u64) -> u64 {
        let steps = self.work / atoms.max(1) as f64;
        if steps.is_finite() && steps >= 1.0 {
            steps.min(u64::MAX as f64) as u64
        } else {
            1
        }
    }

    fn accepts(&self, steps: u64, elapsed: Duration) -> bool {
        let target = self.settings.target.as_secs_f64();
        let secs = elapsed.as_secs_f64();
        // one step is the floor; a single step over budget cannot be shortened
        secs >= target && (secs <= target * self.settings.max_overshoot || steps <= 1)
    }

    fn rescale(&mut self, atoms: u64, steps: u64, elapsed: Duration) -> Result<(), CalibrationError> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Err(CalibrationError::ZeroElapsed { steps });
        }
        let target = self.settings.target.as_secs_f64();
        self.work = steps as f64 * atoms.max(1) as f64 * (2.0 * target / secs);
        Ok(())
    }

    /// Run `run(steps)` until a run lands in the target window.
    ///
    /// `run` may also fail with its own error, which is returned untouched.
    pub async fn calibrate<F, Fut, T, E>(&mut self, atoms: u64, mut run: F) -> Result<Calibrated<T>, E>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Timed,
        E: From<CalibrationError>,
    {
        let mut last_elapsed = Duration::ZERO;
        for iteration in 1..=self.settings.max_iterations {
            let steps = self.steps_for(atoms);
            let outcome = run(steps).await?;
            let elapsed = outcome.elapsed();
            last_elapsed = elapsed;

            let accepted = self.accepts(steps, elapsed);
            debug!(iteration, atoms, steps, elapsed_s = elapsed.as_secs_f64(), accepted, "calibration run");

            // rescale even on acceptance so the next configuration starts closer
            self.rescale(atoms, steps, elapsed)?;
            if accepted {
                return Ok(Calibrated {
                    steps,
                    elapsed,
                    iterations: iteration,
                    run: outcome,
                });
            }
        }

        Err(CalibrationError::NotConverged {
            iterations: self.settings.max_iterations,
            last_elapsed_s: last_elapsed.as_secs_f64(),
        }
        .into())
    }
}
