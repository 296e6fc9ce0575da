//! Energy-aware molecular dynamics benchmark sweeps.
//!
//! Runs a Lennard-Jones benchmark across a list of system sizes, calibrating
//! each run to a target duration, while `powerbench-profiler` samples GPU and
//! wall-socket power into a per-second CSV log.

pub mod calibration;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod format;
pub mod plan;
pub mod runtime;

pub use calibration::{Calibrated, CalibrationController, CalibrationSettings, Timed};
pub use config::{Backend, GpuQueryConfig, RunConfig};
pub use driver::{AutotunedRun, BenchmarkDriver, CaseResult, DriverPhase, DriverSettings, SweepReport};
pub use engine::{
    Engine, EngineRun, HarnessEngine, Integrator, LammpsEngine, NeighborListDiagnostics, PreparedSystem,
    RunRequest, SyntheticEngine,
};
pub use error::{CalibrationError, DriverError, EngineFailure, Result, RunError};
pub use plan::{BenchmarkCase, BenchmarkConfiguration, ComputePlan, LatticeSize, NeighborListAlgorithm};
pub use runtime::{build_engine, probe_meter, run_benchmark, RunOutcome, Sources, INTERRUPTED_EXIT_CODE};
