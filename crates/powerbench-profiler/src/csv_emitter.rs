use crate::error::{Result, TelemetryError};
use crate::shutdown::ShutdownSignal;
use crate::snapshot::{TelemetrySnapshot, TelemetryState};
use crate::ticker::Ticker;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

/// Header of the per-run telemetry log.
pub const TELEMETRY_HEADER: [&str; 6] = ["time", "gpu", "total", "is_running", "n_atoms", "tps"];

/// One row of the telemetry log. `None` fields are written as empty cells.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct TelemetryRow {
    pub time: u64,
    pub gpu: Option<f64>,
    pub total: Option<f64>,
    pub is_running: bool,
    pub n_atoms: Option<u64>,
    pub tps: Option<f64>,
}

impl TelemetryRow {
    pub fn new(tick: u64, snap: &TelemetrySnapshot) -> Self {
        Self {
            time: tick,
            gpu: snap.gpu_power_watts,
            total: snap.total_power_watts,
            is_running: snap.benchmark_running,
            n_atoms: snap.atom_count,
            tps: snap.throughput_steps_per_sec,
        }
    }
}

/// Append-only telemetry log, flushed after every row so a crashed run
/// still leaves a readable file.
pub struct TelemetryCsvWriter<W: Write> {
    inner: csv::Writer<W>,
    rows: u64,
}

impl TelemetryCsvWriter<File> {
    /// Create (truncate) `path` and write the header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Self::from_writer(file)
    }
}

impl<W: Write> TelemetryCsvWriter<W> {
    pub fn from_writer(writer: W) -> Result<Self> {
        let mut inner = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        inner.write_record(TELEMETRY_HEADER)?;
        inner.flush()?;
        Ok(Self { inner, rows: 0 })
    }

    pub fn append(&mut self, row: &TelemetryRow) -> Result<()> {
        self.inner.serialize(row)?;
        self.inner.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(self) -> Result<W> {
        self.inner
            .into_inner()
            .map_err(|e| TelemetryError::Io(e.into_error()))
    }

    /// Write one snapshot per tick until `shutdown` is raised, then close.
    ///
    /// A failed row is logged and skipped; the next tick tries again.
    pub async fn run(
        mut self,
        period: Duration,
        state: TelemetryState,
        shutdown: ShutdownSignal,
    ) -> Result<W> {
        info!(period = ?period, "telemetry writer started");
        let mut failed = 0u64;

        Ticker::new(period)
            .run(&shutdown, |tick| {
                let row = TelemetryRow::new(tick, &state.read_snapshot());
                if let Err(e) = self.append(&row) {
                    failed += 1;
                    error!(tick, error = %e, "failed to write telemetry row");
                }
                async {}
            })
            .await;

        info!(rows = self.rows, failed, "telemetry writer stopped");
        self.finish()
    }
}

/// One row of the aggregated sweep results CSV.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResultRow {
    pub n_atoms: u64,
    pub tps: f64,
    pub tps_autotuned: Option<f64>,
}

/// Write sweep results as `N,TPS` (or `N,TPS,TPS_AT` when any row was
/// autotuned).
pub fn write_results_csv(path: impl AsRef<Path>, rows: &[ResultRow]) -> Result<()> {
    let autotuned = rows.iter().any(|r| r.tps_autotuned.is_some());
    let mut w = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path.as_ref())?;

    if autotuned {
        w.write_record(["N", "TPS", "TPS_AT"])?;
    } else {
        w.write_record(["N", "TPS"])?;
    }
    for r in rows {
        let mut record = vec![r.n_atoms.to_string(), r.tps.to_string()];
        if autotuned {
            record.push(r.tps_autotuned.map(|v| v.to_string()).unwrap_or_default());
        }
        w.write_record(&record)?;
    }
    w.flush()?;
    Ok(())
}
