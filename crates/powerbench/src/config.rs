//! Run configuration
//!
//! Everything one `powerbench run` needs, with the two presets used in
//! practice: a full sweep read from a sizes file, and a short debug sweep
//! over two small systems.

use crate::calibration::CalibrationSettings;
use crate::driver::DriverSettings;
use crate::engine::Integrator;
use crate::error::Result;
use crate::plan::BenchmarkConfiguration;
use powerbench_profiler::MeterConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Which simulation engine to benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Lammps,
    Gamdpy,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Lammps => "lammps",
            Backend::Gamdpy => "gamdpy",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPU power query settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuQueryConfig {
    /// Vendor utility, `nvidia-smi` unless overridden
    pub program: String,
    pub index: u32,
    /// The utility is killed if it has not answered by then
    pub timeout: Duration,
}

impl Default for GpuQueryConfig {
    fn default() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
            index: 0,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Names the output files; reusing one overwrites the previous run
    pub identifier: String,
    pub backend: Backend,
    pub debug: bool,
    pub output_dir: PathBuf,
    /// Problem sizes for full runs
    pub sizes_file: PathBuf,

    /// `None` disables the wall-power sampler
    pub meter: Option<MeterConfig>,
    /// `None` disables the GPU sampler
    pub gpu: Option<GpuQueryConfig>,
    pub sample_period: Duration,
    pub write_period: Duration,

    pub warmup: Duration,
    pub cooldown: Duration,
    pub calibration: CalibrationSettings,
    pub autotune: bool,

    // engine
    pub mpi_ranks: u32,
    pub gpu_accel: bool,
    pub lammps_program: String,
    pub harness: String,
    pub integrator: Integrator,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::full("default")
    }
}

impl RunConfig {
    /// Full sweep: sizes from `nxyzs.txt`, 15 s idle periods, 10 s target.
    pub fn full(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            backend: Backend::default(),
            debug: false,
            output_dir: PathBuf::from("data"),
            sizes_file: PathBuf::from("nxyzs.txt"),
            meter: Some(MeterConfig::default()),
            gpu: Some(GpuQueryConfig::default()),
            sample_period: Duration::from_secs(1),
            write_period: Duration::from_secs(1),
            warmup: Duration::from_secs(15),
            cooldown: Duration::from_secs(15),
            calibration: CalibrationSettings {
                target: Duration::from_secs(10),
                ..CalibrationSettings::default()
            },
            autotune: false,
            mpi_ranks: 1,
            gpu_accel: false,
            lammps_program: "lmp".to_string(),
            harness: "gamdpy-harness".to_string(),
            integrator: Integrator::default(),
        }
    }

    /// Quick sweep over two small systems with 5 s idle periods and target.
    pub fn debug(identifier: impl Into<String>) -> Self {
        Self {
            debug: true,
            warmup: Duration::from_secs(5),
            cooldown: Duration::from_secs(5),
            calibration: CalibrationSettings {
                target: Duration::from_secs(5),
                ..CalibrationSettings::default()
            },
            ..Self::full(identifier)
        }
    }

    /// Problem sizes for this run: the built-in pair in debug mode,
    /// otherwise the sizes file.
    pub fn benchmark_configuration(&self) -> Result<BenchmarkConfiguration> {
        if self.debug {
            Ok(BenchmarkConfiguration::debug())
        } else {
            BenchmarkConfiguration::load(&self.sizes_file)
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            warmup: self.warmup,
            cooldown: self.cooldown,
            calibration: self.calibration,
            autotune: self.autotune,
        }
    }

    /// Per-tick telemetry log, `<output_dir>/<id>-<backend>.csv`.
    pub fn telemetry_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.csv", self.identifier, self.backend))
    }

    /// Sweep summary, `<output_dir>/benchmark_<backend>_<id>.csv`.
    pub fn results_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("benchmark_{}_{}.csv", self.backend, self.identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        let full = RunConfig::full("a100");
        assert!(!full.debug);
        assert_eq!(full.warmup, Duration::from_secs(15));
        assert_eq!(full.calibration.target, Duration::from_secs(10));
        assert_eq!(full.calibration.seed, 1e7);
        assert_eq!(full.meter.as_ref().unwrap().baud_rate, 9600);

        let debug = RunConfig::debug("a100");
        assert!(debug.debug);
        assert_eq!(debug.cooldown, Duration::from_secs(5));
        assert_eq!(debug.calibration.target, Duration::from_secs(5));
        assert_eq!(debug.benchmark_configuration().unwrap().len(), 2);
    }

    #[test]
    fn output_paths_name_backend_and_identifier() {
        let config = RunConfig {
            backend: Backend::Gamdpy,
            output_dir: PathBuf::from("/tmp/out"),
            ..RunConfig::debug("run7")
        };
        assert_eq!(config.telemetry_path(), PathBuf::from("/tmp/out/run7-gamdpy.csv"));
        assert_eq!(
            config.results_path(),
            PathBuf::from("/tmp/out/benchmark_gamdpy_run7.csv")
        );
    }

    #[test]
    fn full_run_reads_sizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sizes = dir.path().join("nxyzs.txt");
        std::fs::write(&sizes, "8,8,8\n8,8,16\n16,16,16\n").unwrap();
        let config = RunConfig {
            sizes_file: sizes,
            ..RunConfig::full("x")
        };
        assert_eq!(config.benchmark_configuration().unwrap().len(), 3);

        let missing = RunConfig {
            sizes_file: dir.path().join("absent.txt"),
            ..RunConfig::full("x")
        };
        assert!(missing.benchmark_configuration().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = RunConfig::debug("json");
        let text = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
        assert!(text.contains("\"backend\":\"lammps\""));
    }
}
