//! Error types for the benchmark driver
//!
//! Unlike telemetry errors, nothing here is recovered from: an engine or
//! calibration failure aborts the whole sweep.

use powerbench_profiler::TelemetryError;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Failure reported by (or while running) the simulation engine
#[derive(Error, Debug)]
pub enum EngineFailure {
    /// Engine process could not be started or fed its script
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Engine process exited unsuccessfully
    #[error("engine exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    /// Neighbor-list overflow counters were nonzero after the run
    #[error("neighbor-list overflow flags set: {flags:?}")]
    NeighborListOverflow { flags: [u64; 2] },

    /// Engine output could not be understood
    #[error("unexpected engine output: {0}")]
    Protocol(String),

    /// The blocking task running the engine died
    #[error("engine task aborted: {0}")]
    Aborted(String),
}

/// Calibration loop gave up
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// A run reported no measurable wall time, so it cannot be rescaled
    #[error("run of {steps} steps reported zero elapsed time")]
    ZeroElapsed { steps: u64 },

    /// A run completed without a single neighbor-list rebuild
    #[error("run of {steps} steps performed no neighbor-list rebuilds")]
    NoNeighborListRebuilds { steps: u64 },

    /// Iteration budget exhausted outside the target window
    #[error("no run landed in the target window after {iterations} iterations (last: {last_elapsed_s:.3}s)")]
    NotConverged { iterations: u32, last_elapsed_s: f64 },
}

/// Error from a single calibration or measuring run, before it is tied to
/// a configuration.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Engine(#[from] EngineFailure),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

impl RunError {
    /// Attach the configuration the run belonged to.
    pub fn on_case(self, case: impl Into<String>) -> DriverError {
        let case = case.into();
        match self {
            RunError::Engine(source) => DriverError::Engine { case, source },
            RunError::Calibration(source) => DriverError::Calibration { case, source },
        }
    }
}

/// Main error type for a benchmark run
#[derive(Error, Debug)]
pub enum DriverError {
    /// Engine failed on a configuration
    #[error("engine failure on configuration {case}: {source}")]
    Engine {
        case: String,
        #[source]
        source: EngineFailure,
    },

    /// Workload calibration failed on a configuration
    #[error("calibration failed on configuration {case}: {source}")]
    Calibration {
        case: String,
        #[source]
        source: CalibrationError,
    },

    /// Invalid configuration file or settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Telemetry output could not be written
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),
}

impl From<csv::Error> for DriverError {
    fn from(err: csv::Error) -> Self {
        DriverError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DriverError {
    fn from(err: tokio::task::JoinError) -> Self {
        DriverError::Task(err.to_string())
    }
}
