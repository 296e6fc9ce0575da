//! Benchmark driver
//!
//! Runs the configured sweep against one [`Engine`], publishing progress
//! into the shared telemetry state:
//!
//! ```text
//! Idle -> Warmup -> (per configuration) Calibrating -> Measuring -> Cooldown -> ... -> Done
//! ```
//!
//! The driver owns the shutdown signal's only producer. Whether the sweep
//! completes, fails, or is interrupted, it raises the signal exactly once on
//! the way out so samplers and the writer can flush and stop.

use crate::calibration::{CalibrationController, CalibrationSettings};
use crate::engine::{Engine, EngineRun, PreparedSystem, RunRequest};
use crate::error::{CalibrationError, EngineFailure, Result, RunError};
use crate::plan::{BenchmarkCase, BenchmarkConfiguration, ComputePlan, LatticeSize};
use powerbench_profiler::{ResultRow, ShutdownSignal, TelemetryState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Idle,
    Warmup,
    Calibrating,
    Measuring,
    Cooldown,
    Done,
}

impl fmt::Display for DriverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverPhase::Idle => "idle",
            DriverPhase::Warmup => "warmup",
            DriverPhase::Calibrating => "calibrating",
            DriverPhase::Measuring => "measuring",
            DriverPhase::Cooldown => "cooldown",
            DriverPhase::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Idle time before the first configuration (power baseline)
    pub warmup: Duration,
    /// Idle time after each configuration
    pub cooldown: Duration,
    pub calibration: CalibrationSettings,
    /// Follow each calibrated run with one engine-autotuned run
    pub autotune: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(15),
            cooldown: Duration::from_secs(15),
            calibration: CalibrationSettings::default(),
            autotune: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutotunedRun {
    pub steps_per_sec: f64,
    pub elapsed: Duration,
    pub plan: Option<ComputePlan>,
}

/// Measurement for one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseResult {
    pub size: LatticeSize,
    pub atoms: u64,
    pub steps: u64,
    pub elapsed: Duration,
    pub steps_per_sec: f64,
    /// Calibration runs, including the accepted one
    pub iterations: u32,
    pub plan: Option<ComputePlan>,
    pub autotuned: Option<AutotunedRun>,
}

impl CaseResult {
    pub fn result_row(&self) -> ResultRow {
        ResultRow {
            n_atoms: self.atoms,
            tps: self.steps_per_sec,
            tps_autotuned: self.autotuned.as_ref().map(|a| a.steps_per_sec),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub cases: Vec<CaseResult>,
    /// Shutdown was raised from outside before the sweep finished
    pub interrupted: bool,
}

impl SweepReport {
    pub fn result_rows(&self) -> Vec<ResultRow> {
        self.cases.iter().map(CaseResult::result_row).collect()
    }
}

pub struct BenchmarkDriver {
    engine: Arc<dyn Engine>,
    configuration: BenchmarkConfiguration,
    settings: DriverSettings,
    state: TelemetryState,
    shutdown: ShutdownSignal,
    calibration: CalibrationController,
    phase: DriverPhase,
}

impl BenchmarkDriver {
    pub fn new(
        engine: Arc<dyn Engine>,
        configuration: BenchmarkConfiguration,
        settings: DriverSettings,
        state: TelemetryState,
        shutdown: ShutdownSignal,
    ) -> Self {
        if settings.autotune && !engine.supports_autotune() {
            warn!(engine = engine.name(), "autotune requested but not supported; skipping autotuned runs");
        }
        Self {
            calibration: CalibrationController::new(settings.calibration),
            engine,
            configuration,
            settings,
            state,
            shutdown,
            phase: DriverPhase::Idle,
        }
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    fn enter(&mut self, phase: DriverPhase) {
        info!(from = %self.phase, to = %phase, "driver phase");
        self.phase = phase;
    }

    /// Run the whole sweep, then raise the shutdown signal.
    pub async fn run(&mut self) -> Result<SweepReport> {
        info!(
            engine = self.engine.name(),
            configurations = self.configuration.len(),
            "starting sweep"
        );
        let outcome = self.sweep().await;

        self.enter(DriverPhase::Done);
        if !self.shutdown.raise() {
            info!("shutdown was already raised");
        }
        outcome
    }

    async fn sweep(&mut self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        self.enter(DriverPhase::Warmup);
        if !self.shutdown.sleep(self.settings.warmup).await {
            report.interrupted = true;
            return Ok(report);
        }

        let cases = self.configuration.cases().to_vec();
        for case in cases {
            if self.shutdown.is_raised() {
                report.interrupted = true;
                break;
            }

            let result = self.run_case(case).await?;
            info!(
                atoms = result.atoms,
                tps = result.steps_per_sec,
                steps = result.steps,
                elapsed_s = result.elapsed.as_secs_f64(),
                "configuration done"
            );
            report.cases.push(result);

            self.enter(DriverPhase::Cooldown);
            if !self.shutdown.sleep(self.settings.cooldown).await {
                report.interrupted = true;
                break;
            }
        }

        if report.interrupted {
            warn!(completed = report.cases.len(), "sweep interrupted");
        }
        Ok(report)
    }

    #[tracing::instrument(skip(self), fields(size = %case.size))]
    async fn run_case(&mut self, case: BenchmarkCase) -> Result<CaseResult> {
        let label = case.size.to_string();
        let engine = Arc::clone(&self.engine);
        let size = case.size;
        let system = tokio::task::spawn_blocking(move || engine.prepare(size))
            .await
            .map_err(|e| EngineFailure::Aborted(e.to_string()))
            .and_then(|prepared| prepared)
            .map_err(|e| RunError::from(e).on_case(label.clone()))?;
        let system = Arc::new(system);

        self.state.begin_configuration(system.atoms);
        match self.measure(&system, case.plan).await {
            Ok(result) => {
                self.state.finish_configuration(result.steps_per_sec);
                Ok(result)
            }
            Err(e) => {
                self.state.abandon_configuration();
                Err(e.on_case(label))
            }
        }
    }

    async fn measure(
        &mut self,
        system: &Arc<PreparedSystem>,
        plan: Option<ComputePlan>,
    ) -> std::result::Result<CaseResult, RunError> {
        self.enter(DriverPhase::Calibrating);
        let engine = Arc::clone(&self.engine);
        let calibrated = self
            .calibration
            .calibrate(system.atoms, |steps| {
                let request = RunRequest {
                    steps,
                    plan,
                    autotune: false,
                };
                execute(Arc::clone(&engine), Arc::clone(system), request)
            })
            .await?;
        // short calibration runs may legitimately miss every rebuild; the accepted one may not
        require_rebuilds(&calibrated.run)?;

        self.enter(DriverPhase::Measuring);
        let steps_per_sec = calibrated.steps_per_sec();
        let used_plan = calibrated.run.plan.or(plan);

        let autotuned = if self.settings.autotune && self.engine.supports_autotune() {
            let request = RunRequest {
                steps: calibrated.steps,
                plan: used_plan,
                autotune: true,
            };
            let run = execute(Arc::clone(&self.engine), Arc::clone(system), request).await?;
            require_rebuilds(&run)?;
            if run.elapsed.is_zero() {
                return Err(CalibrationError::ZeroElapsed { steps: run.steps }.into());
            }
            let tuned = AutotunedRun {
                steps_per_sec: run.steps as f64 / run.elapsed.as_secs_f64(),
                elapsed: run.elapsed,
                plan: run.plan,
            };
            info!(tps = tuned.steps_per_sec, plan = ?tuned.plan, "autotuned run");
            Some(tuned)
        } else {
            None
        };

        Ok(CaseResult {
            size: system.size,
            atoms: system.atoms,
            steps: calibrated.steps,
            elapsed: calibrated.elapsed,
            steps_per_sec,
            iterations: calibrated.iterations,
            plan: used_plan,
            autotuned,
        })
    }
}

/// One engine run on the blocking pool. Neighbor-list overflow fails any run.
async fn execute(
    engine: Arc<dyn Engine>,
    system: Arc<PreparedSystem>,
    request: RunRequest,
) -> std::result::Result<EngineRun, RunError> {
    let run = tokio::task::spawn_blocking(move || engine.run(&system, &request))
        .await
        .map_err(|e| EngineFailure::Aborted(e.to_string()))??;

    if let Some(diag) = run.diagnostics {
        if diag.overflowed() {
            return Err(EngineFailure::NeighborListOverflow { flags: diag.overflow }.into());
        }
    }
    Ok(run)
}

/// A measured run that never rebuilt its neighbor list is not representative.
fn require_rebuilds(run: &EngineRun) -> std::result::Result<(), RunError> {
    match run.diagnostics {
        Some(diag) if diag.rebuilds == 0 => Err(CalibrationError::NoNeighborListRebuilds { steps: run.steps }.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyntheticEngine;
    use crate::error::DriverError;
    use crate::plan::NeighborListAlgorithm;

    fn settings() -> DriverSettings {
        DriverSettings {
            warmup: Duration::from_secs(5),
            cooldown: Duration::from_secs(5),
            calibration: CalibrationSettings {
                target: Duration::from_secs(5),
                seed: 1e5,
                ..CalibrationSettings::default()
            },
            autotune: false,
        }
    }

    fn driver(engine: SyntheticEngine, settings: DriverSettings) -> (BenchmarkDriver, TelemetryState, ShutdownSignal) {
        let state = TelemetryState::new();
        let shutdown = ShutdownSignal::new();
        let driver = BenchmarkDriver::new(
            Arc::new(engine),
            BenchmarkConfiguration::debug(),
            settings,
            state.clone(),
            shutdown.clone(),
        );
        (driver, state, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_measures_every_configuration() {
        let (mut driver, state, shutdown) = driver(SyntheticEngine::new(Duration::from_nanos(500)), settings());
        let report = driver.run().await.unwrap();

        assert!(!report.interrupted);
        assert_eq!(report.cases.len(), 2);
        assert_eq!(report.cases[0].atoms, 512);
        assert_eq!(report.cases[1].atoms, 1024);
        for case in &report.cases {
            assert!(case.elapsed >= Duration::from_secs(5));
            assert!(case.iterations <= 5);
            assert!(case.autotuned.is_none());
        }

        assert_eq!(driver.phase(), DriverPhase::Done);
        assert!(shutdown.is_raised());
        let snap = state.read_snapshot();
        assert!(!snap.benchmark_running);
        assert_eq!(snap.atom_count, None);
        assert_eq!(snap.throughput_steps_per_sec, Some(report.cases[1].steps_per_sec));
    }

    #[tokio::test(start_paused = true)]
    async fn engine_failure_names_configuration_and_still_shuts_down() {
        let engine = SyntheticEngine::new(Duration::from_nanos(500)).failing_on(LatticeSize::new(4, 8, 8).unwrap());
        let (mut driver, state, shutdown) = driver(engine, settings());
        let err = driver.run().await.unwrap_err();

        match err {
            DriverError::Engine { case, source } => {
                assert_eq!(case, "4x8x8");
                assert!(matches!(source, EngineFailure::Exit { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(shutdown.is_raised());
        assert!(!state.read_snapshot().benchmark_running);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_aborts_sweep() {
        let engine = SyntheticEngine::new(Duration::from_nanos(500)).with_overflow([0, 3]);
        let (mut driver, _, _) = driver(engine, settings());
        let err = driver.run().await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Engine {
                source: EngineFailure::NeighborListOverflow { flags: [0, 3] },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rebuilds_is_calibration_failure() {
        // rebuild interval longer than any run
        let engine = SyntheticEngine::new(Duration::from_millis(1)).with_rebuild_every(Some(u64::MAX));
        let (mut driver, _, _) = driver(engine, settings());
        let err = driver.run().await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Calibration {
                source: CalibrationError::NoNeighborListRebuilds { .. },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn short_runs_without_rebuilds_are_rescaled() {
        // first run of 512 atoms is a single step, well inside one rebuild interval
        let engine = SyntheticEngine::new(Duration::from_nanos(500));
        let (mut driver, _, shutdown) = driver(
            engine,
            DriverSettings {
                calibration: CalibrationSettings {
                    seed: 1e3,
                    ..settings().calibration
                },
                ..settings()
            },
        );
        let report = driver.run().await.unwrap();

        assert_eq!(report.cases.len(), 2);
        assert!(report.cases[0].iterations >= 2);
        for case in &report.cases {
            assert!(case.steps >= 20);
            assert!(case.elapsed >= Duration::from_secs(5));
        }
        assert!(shutdown.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn engines_without_diagnostics_are_accepted() {
        let engine = SyntheticEngine::new(Duration::from_nanos(500)).with_rebuild_every(None);
        let (mut driver, _, _) = driver(engine, settings());
        assert_eq!(driver.run().await.unwrap().cases.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn autotune_adds_one_run_per_configuration() {
        let engine = Arc::new(SyntheticEngine::new(Duration::from_nanos(500)));
        let state = TelemetryState::new();
        let shutdown = ShutdownSignal::new();
        let mut driver = BenchmarkDriver::new(
            engine.clone(),
            BenchmarkConfiguration::debug(),
            DriverSettings {
                autotune: true,
                ..settings()
            },
            state,
            shutdown,
        );
        let report = driver.run().await.unwrap();

        let calibration_runs: u64 = report.cases.iter().map(|c| u64::from(c.iterations)).sum();
        assert_eq!(engine.runs(), calibration_runs + 2);
        for case in &report.cases {
            let tuned = case.autotuned.as_ref().unwrap();
            assert!(tuned.steps_per_sec > case.steps_per_sec);
            assert!(tuned.plan.is_some());
        }
        assert!(report.result_rows()[0].tps_autotuned.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn precomputed_plan_reaches_engine() {
        let plan = ComputePlan::new(32, 4, 0.3, NeighborListAlgorithm::NSquared, false, true).unwrap();
        let configuration = BenchmarkConfiguration::new(vec![BenchmarkCase {
            size: LatticeSize::new(4, 4, 8).unwrap(),
            plan: Some(plan),
        }])
        .unwrap();
        let mut driver = BenchmarkDriver::new(
            Arc::new(SyntheticEngine::new(Duration::from_nanos(500))),
            configuration,
            settings(),
            TelemetryState::new(),
            ShutdownSignal::new(),
        );
        let report = driver.run().await.unwrap();
        assert_eq!(report.cases[0].plan, Some(plan));
    }

    #[tokio::test(start_paused = true)]
    async fn external_shutdown_interrupts_between_configurations() {
        let (mut driver, _, shutdown) = driver(SyntheticEngine::new(Duration::from_nanos(500)), settings());
        shutdown.raise();
        let report = driver.run().await.unwrap();
        assert!(report.interrupted);
        assert!(report.cases.is_empty());
        assert_eq!(driver.phase(), DriverPhase::Done);
    }

    /// Records the shared state as seen from inside each engine run.
    struct Observing {
        inner: SyntheticEngine,
        state: TelemetryState,
        seen: parking_lot::Mutex<Vec<powerbench_profiler::TelemetrySnapshot>>,
    }

    impl Engine for Observing {
        fn name(&self) -> &str {
            "observing"
        }

        fn prepare(&self, size: LatticeSize) -> std::result::Result<PreparedSystem, EngineFailure> {
            self.inner.prepare(size)
        }

        fn run(&self, system: &PreparedSystem, request: &RunRequest) -> std::result::Result<EngineRun, EngineFailure> {
            self.seen.lock().push(self.state.read_snapshot());
            self.inner.run(system, request)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn running_flag_covers_measurement_only() {
        let state = TelemetryState::new();
        let engine = Arc::new(Observing {
            inner: SyntheticEngine::new(Duration::from_nanos(500)),
            state: state.clone(),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let mut driver = BenchmarkDriver::new(
            engine.clone(),
            BenchmarkConfiguration::debug(),
            settings(),
            state.clone(),
            ShutdownSignal::new(),
        );

        let before = state.read_snapshot();
        let report = driver.run().await.unwrap();
        assert!(!before.benchmark_running);

        let seen = engine.seen.lock();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|s| s.benchmark_running));
        let first = report.cases[0].iterations as usize;
        assert!(seen[..first].iter().all(|s| s.atom_count == Some(512)));
        assert!(seen[first..].iter().all(|s| s.atom_count == Some(1024)));
        // the second configuration starts with the first one's throughput published
        assert_eq!(seen[first].throughput_steps_per_sec, Some(report.cases[0].steps_per_sec));
    }
}
