//! Task orchestration for one benchmark run
//!
//! Spawns the telemetry writer and both samplers, runs the driver on the
//! current task, and joins everything once the driver has raised the
//! shutdown signal. The telemetry file is always closed before a driver
//! error is returned.

use crate::config::{Backend, RunConfig};
use crate::driver::{BenchmarkDriver, SweepReport};
use crate::engine::{Engine, HarnessEngine, LammpsEngine};
use crate::error::Result;
use powerbench_profiler::{
    write_results_csv, Eng110Meter, Eng110Source, MeterConfig, MeterFrame, NvidiaSmiSource, PowerSource,
    Sampler, SamplerStats, ShutdownSignal, TelemetryCsvWriter, TelemetryError, TelemetryState,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Power sources for a run; `None` leaves that column empty.
#[derive(Clone, Default)]
pub struct Sources {
    pub gpu: Option<Arc<dyn PowerSource>>,
    pub total: Option<Arc<dyn PowerSource>>,
}

impl Sources {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            gpu: config.gpu.as_ref().map(|gpu| {
                Arc::new(NvidiaSmiSource::new(gpu.program.clone(), gpu.index).with_timeout(gpu.timeout))
                    as Arc<dyn PowerSource>
            }),
            total: config
                .meter
                .clone()
                .map(|meter| Arc::new(Eng110Source::new(meter)) as Arc<dyn PowerSource>),
        }
    }
}

/// Engine backend selected by the configuration.
pub fn build_engine(config: &RunConfig) -> Arc<dyn Engine> {
    match config.backend {
        Backend::Lammps => Arc::new(LammpsEngine {
            program: config.lammps_program.clone(),
            mpi_launcher: Some("mpirun".to_string()),
            mpi_ranks: config.mpi_ranks,
            gpu_accel: config.gpu_accel,
        }),
        Backend::Gamdpy => Arc::new(HarnessEngine::new(config.harness.clone(), config.integrator)),
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: SweepReport,
    pub telemetry_path: PathBuf,
    /// Written only when at least one configuration completed
    pub results_path: Option<PathBuf>,
    pub gpu_stats: Option<SamplerStats>,
    pub total_stats: Option<SamplerStats>,
}

/// Exit status of an interrupted sweep (128 + SIGINT).
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

impl RunOutcome {
    /// Process exit status: zero only for a sweep that ran to completion.
    pub fn exit_code(&self) -> i32 {
        if self.report.interrupted {
            INTERRUPTED_EXIT_CODE
        } else {
            0
        }
    }
}

fn spawn_sampler(
    sampler: Option<Sampler>,
    state: &TelemetryState,
    shutdown: &ShutdownSignal,
) -> Option<JoinHandle<SamplerStats>> {
    sampler.map(|s| tokio::spawn(s.run(state.clone(), shutdown.clone())))
}

async fn join_sampler(task: Option<JoinHandle<SamplerStats>>) -> Result<Option<SamplerStats>> {
    match task {
        Some(task) => Ok(Some(task.await?)),
        None => Ok(None),
    }
}

/// Run the whole sweep with telemetry.
///
/// `shutdown` may be raised from outside (e.g. on Ctrl-C) to stop the sweep
/// after the current configuration.
pub async fn run_benchmark(
    config: &RunConfig,
    engine: Arc<dyn Engine>,
    sources: Sources,
    shutdown: ShutdownSignal,
) -> Result<RunOutcome> {
    // bad sizes file fails before any output exists
    let configuration = config.benchmark_configuration()?;
    std::fs::create_dir_all(&config.output_dir)?;

    let telemetry_path = config.telemetry_path();
    let writer = TelemetryCsvWriter::create(&telemetry_path)?;
    info!(path = %telemetry_path.display(), "writing telemetry");

    let state = TelemetryState::new();
    let writer_task = tokio::spawn(writer.run(config.write_period, state.clone(), shutdown.clone()));
    let gpu_task = spawn_sampler(
        sources.gpu.map(|src| Sampler::gpu(src, config.sample_period)),
        &state,
        &shutdown,
    );
    let total_task = spawn_sampler(
        sources.total.map(|src| Sampler::total(src, config.sample_period)),
        &state,
        &shutdown,
    );

    let mut driver = BenchmarkDriver::new(
        engine,
        configuration,
        config.driver_settings(),
        state,
        shutdown,
    );
    let sweep = driver.run().await;

    writer_task.await??;
    let gpu_stats = join_sampler(gpu_task).await?;
    let total_stats = join_sampler(total_task).await?;

    let report = match sweep {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "sweep failed");
            return Err(e);
        }
    };

    let results_path = if report.cases.is_empty() {
        None
    } else {
        let path = config.results_path();
        write_results_csv(&path, &report.result_rows())?;
        info!(path = %path.display(), rows = report.cases.len(), "wrote sweep results");
        Some(path)
    };

    Ok(RunOutcome {
        report,
        telemetry_path,
        results_path,
        gpu_stats,
        total_stats,
    })
}

/// Query the meter up to `count` times, `period` apart, handing each result
/// to `on_reading` as it arrives. Returns the number of queries made.
pub async fn probe_meter<F>(
    meter: MeterConfig,
    count: u64,
    period: Duration,
    shutdown: &ShutdownSignal,
    mut on_reading: F,
) -> u64
where
    F: FnMut(u64, std::result::Result<MeterFrame, TelemetryError>),
{
    let port = meter.port.clone();
    let meter = Arc::new(Eng110Meter::new(meter));
    let mut taken = 0;
    for index in 0..count {
        if index > 0 && !shutdown.sleep(period).await {
            break;
        }
        let m = Arc::clone(&meter);
        let result = tokio::task::spawn_blocking(move || m.query())
            .await
            .unwrap_or_else(|e| {
                Err(TelemetryError::DeviceIo {
                    port: port.clone(),
                    message: e.to_string(),
                })
            });
        on_reading(index, result);
        taken += 1;
    }
    taken
}
