//! Simulation engine backends
//!
//! An [`Engine`] builds an FCC Lennard-Jones system for a lattice size and
//! runs it for a given number of steps, reporting wall time and, where the
//! backend can, neighbor-list diagnostics. Engine calls block for seconds
//! to minutes; the driver runs them on the blocking pool.

use crate::calibration::Timed;
use crate::error::EngineFailure;
use crate::plan::{ComputePlan, LatticeSize};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Reduced density of the benchmark lattice.
pub const LJ_DENSITY: f64 = 0.8442;
/// Pair cutoff in reduced units.
pub const LJ_CUTOFF: f64 = 2.5;

/// A system ready to be run.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSystem {
    pub size: LatticeSize,
    pub atoms: u64,
    /// Engine input that builds the system, if the backend takes one
    pub script: Option<String>,
}

/// One run of a prepared system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunRequest {
    pub steps: u64,
    pub plan: Option<ComputePlan>,
    /// Let the engine pick its own plan before timing
    pub autotune: bool,
}

/// Pair-list bookkeeping reported after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NeighborListDiagnostics {
    pub rebuilds: u64,
    /// Both must be zero for the run to count
    pub overflow: [u64; 2],
}

impl NeighborListDiagnostics {
    pub fn overflowed(&self) -> bool {
        self.overflow != [0, 0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineRun {
    pub steps: u64,
    pub elapsed: Duration,
    pub diagnostics: Option<NeighborListDiagnostics>,
    /// Plan the engine actually used
    pub plan: Option<ComputePlan>,
}

impl Timed for EngineRun {
    fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// A molecular dynamics backend.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn prepare(&self, size: LatticeSize) -> Result<PreparedSystem, EngineFailure>;

    fn run(&self, system: &PreparedSystem, request: &RunRequest) -> Result<EngineRun, EngineFailure>;

    /// Whether [`RunRequest::autotune`] means anything to this backend.
    fn supports_autotune(&self) -> bool {
        false
    }
}

/// Integration scheme for the harness backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum Integrator {
    #[default]
    #[serde(rename = "NVE")]
    Nve,
    #[serde(rename = "NVT")]
    Nvt,
    #[serde(rename = "NVT_Langevin")]
    #[value(name = "nvt-langevin")]
    NvtLangevin,
}

/// Run `program` with `input` on stdin, returning stdout and the wall time
/// around the process.
fn run_process(program: &str, args: &[String], input: &str) -> Result<(String, Duration), EngineFailure> {
    let launch = |source| EngineFailure::Launch {
        program: program.to_string(),
        source,
    };

    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(launch)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).map_err(launch)?;
    }
    let output = child.wait_with_output().map_err(launch)?;
    let wall = start.elapsed();

    if !output.status.success() {
        return Err(EngineFailure::Exit {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok((String::from_utf8_lossy(&output.stdout).into_owned(), wall))
}

/// LAMMPS, one process per run, optionally under `mpirun`.
#[derive(Debug, Clone)]
pub struct LammpsEngine {
    pub program: String,
    pub mpi_launcher: Option<String>,
    pub mpi_ranks: u32,
    pub gpu_accel: bool,
}

impl Default for LammpsEngine {
    fn default() -> Self {
        Self {
            program: "lmp".to_string(),
            mpi_launcher: Some("mpirun".to_string()),
            mpi_ranks: 1,
            gpu_accel: false,
        }
    }
}

impl LammpsEngine {
    /// Program and arguments for one run.
    pub fn command_line(&self) -> (String, Vec<String>) {
        let mut args = Vec::new();
        let program = match &self.mpi_launcher {
            Some(launcher) => {
                args.extend(["-np".to_string(), self.mpi_ranks.max(1).to_string()]);
                args.push(self.program.clone());
                launcher.clone()
            }
            None => self.program.clone(),
        };
        args.extend(["-log".to_string(), "none".to_string()]);
        if self.gpu_accel {
            args.extend(["-sf", "gpu", "-pk", "gpu", "1"].map(String::from));
        }
        (program, args)
    }

    /// Input deck that builds the benchmark system.
    pub fn setup_script(&self, size: LatticeSize) -> String {
        format!(
            "units           lj\n\
             atom_style      atomic\n\
             lattice         fcc {LJ_DENSITY}\n\
             region          box block 0 {nx} 0 {ny} 0 {nz}\n\
             create_box      1 box\n\
             create_atoms    1 box\n\
             mass            1 1.0\n\
             velocity        all create 1.44 87287 loop geom\n\
             pair_style      lj/cut {LJ_CUTOFF}\n\
             pair_coeff      1 1 1.0 1.0 {LJ_CUTOFF}\n\
             neighbor        0.3 bin\n\
             neigh_modify    delay 0 every 20 check no\n\
             fix             1 all nve\n",
            nx = size.nx(),
            ny = size.ny(),
            nz = size.nz(),
        )
    }
}

/// Pull the timed-loop duration out of LAMMPS screen output
/// (`Loop time of 1.234 on 4 procs for 1000 steps with 2048 atoms`).
///
/// `Ok(None)` when the output has no such line.
pub fn parse_loop_time(output: &str) -> Result<Option<Duration>, EngineFailure> {
    let Some(rest) = output
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix("Loop time of "))
    else {
        return Ok(None);
    };
    let invalid = || EngineFailure::Protocol(format!("invalid loop time line: {rest:?}"));
    let secs: f64 = rest
        .split_whitespace()
        .next()
        .and_then(|word| word.parse().ok())
        .ok_or_else(invalid)?;
    Duration::try_from_secs_f64(secs).map(Some).map_err(|_| invalid())
}

impl Engine for LammpsEngine {
    fn name(&self) -> &str {
        "lammps"
    }

    fn prepare(&self, size: LatticeSize) -> Result<PreparedSystem, EngineFailure> {
        Ok(PreparedSystem {
            size,
            atoms: size.fcc_atoms(),
            script: Some(self.setup_script(size)),
        })
    }

    fn run(&self, system: &PreparedSystem, request: &RunRequest) -> Result<EngineRun, EngineFailure> {
        let setup = system
            .script
            .as_deref()
            .ok_or_else(|| EngineFailure::Protocol("system was not prepared by lammps".into()))?;
        let input = format!("{setup}run {}\n", request.steps);

        let (program, args) = self.command_line();
        let (stdout, wall) = run_process(&program, &args, &input)?;

        // wall time includes lattice setup; prefer the engine's own loop timer
        let elapsed = parse_loop_time(&stdout)?.unwrap_or(wall);
        debug!(steps = request.steps, elapsed_s = elapsed.as_secs_f64(), wall_s = wall.as_secs_f64(), "lammps run");

        Ok(EngineRun {
            steps: request.steps,
            elapsed,
            diagnostics: None,
            plan: None,
        })
    }
}

#[derive(Debug, Serialize)]
struct HarnessRequest<'a> {
    nxyz: LatticeSize,
    steps: u64,
    integrator: Integrator,
    compute_plan: Option<&'a ComputePlan>,
    autotune: bool,
}

#[derive(Debug, Deserialize)]
struct HarnessReply {
    n_atoms: u64,
    elapsed_s: f64,
    steps: u64,
    nb_rebuilds: Option<u64>,
    nb_overflow: Option<[u64; 2]>,
    compute_plan: Option<ComputePlan>,
}

/// A GPU MD package driven through a small harness program that speaks one
/// JSON request on stdin and one JSON reply line on stdout.
#[derive(Debug, Clone)]
pub struct HarnessEngine {
    pub program: String,
    pub args: Vec<String>,
    pub integrator: Integrator,
}

impl HarnessEngine {
    pub fn new(program: impl Into<String>, integrator: Integrator) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            integrator,
        }
    }

    fn request_json(&self, system: &PreparedSystem, request: &RunRequest) -> Result<String, EngineFailure> {
        let body = HarnessRequest {
            nxyz: system.size,
            steps: request.steps,
            integrator: self.integrator,
            compute_plan: request.plan.as_ref(),
            autotune: request.autotune,
        };
        serde_json::to_string(&body).map_err(|e| EngineFailure::Protocol(e.to_string()))
    }
}

/// Decode the harness reply: the last non-empty stdout line must be JSON.
fn parse_harness_reply(system: &PreparedSystem, stdout: &str) -> Result<EngineRun, EngineFailure> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(|| EngineFailure::Protocol("harness printed nothing".into()))?;
    let reply: HarnessReply = serde_json::from_str(line)
        .map_err(|e| EngineFailure::Protocol(format!("{e}: {line:?}")))?;

    if reply.n_atoms != system.atoms {
        return Err(EngineFailure::Protocol(format!(
            "harness built {} atoms, expected {}",
            reply.n_atoms, system.atoms
        )));
    }
    let elapsed = Duration::try_from_secs_f64(reply.elapsed_s)
        .map_err(|_| EngineFailure::Protocol(format!("invalid elapsed time {}", reply.elapsed_s)))?;

    let diagnostics = match (reply.nb_rebuilds, reply.nb_overflow) {
        (None, None) => None,
        (rebuilds, overflow) => Some(NeighborListDiagnostics {
            rebuilds: rebuilds.unwrap_or(0),
            overflow: overflow.unwrap_or_default(),
        }),
    };
    Ok(EngineRun {
        steps: reply.steps,
        elapsed,
        diagnostics,
        plan: reply.compute_plan,
    })
}

impl Engine for HarnessEngine {
    fn name(&self) -> &str {
        "gamdpy"
    }

    fn prepare(&self, size: LatticeSize) -> Result<PreparedSystem, EngineFailure> {
        Ok(PreparedSystem {
            size,
            atoms: size.fcc_atoms(),
            script: None,
        })
    }

    fn run(&self, system: &PreparedSystem, request: &RunRequest) -> Result<EngineRun, EngineFailure> {
        let input = self.request_json(system, request)?;
        let (stdout, _) = run_process(&self.program, &self.args, &input)?;
        parse_harness_reply(system, &stdout)
    }

    fn supports_autotune(&self) -> bool {
        true
    }
}

/// In-process stand-in with a configurable cost model, for tests and dry
/// runs.
///
/// Elapsed time is `overhead + steps * atoms * cost_per_atom_step`. With
/// `sleep` set the engine also blocks for that long.
#[derive(Debug, Default)]
pub struct SyntheticEngine {
    pub cost_per_atom_step: Duration,
    pub overhead: Duration,
    pub sleep: bool,
    /// Steps between neighbor-list rebuilds; `None` reports no diagnostics
    pub rebuild_every: Option<u64>,
    pub overflow: [u64; 2],
    /// Sizes on which the engine exits unsuccessfully
    pub fail_on: Vec<LatticeSize>,
    /// Autotuned runs are this much faster
    pub autotune_speedup: f64,
    runs: AtomicU64,
}

impl SyntheticEngine {
    pub fn new(cost_per_atom_step: Duration) -> Self {
        Self {
            cost_per_atom_step,
            rebuild_every: Some(20),
            autotune_speedup: 1.25,
            ..Self::default()
        }
    }

    pub fn sleeping(mut self) -> Self {
        self.sleep = true;
        self
    }

    pub fn with_overhead(mut self, overhead: Duration) -> Self {
        self.overhead = overhead;
        self
    }

    pub fn with_rebuild_every(mut self, steps: Option<u64>) -> Self {
        self.rebuild_every = steps;
        self
    }

    pub fn with_overflow(mut self, overflow: [u64; 2]) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn failing_on(mut self, size: LatticeSize) -> Self {
        self.fail_on.push(size);
        self
    }

    /// Number of runs performed so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    fn tuned_plan() -> Option<ComputePlan> {
        ComputePlan::new(64, 8, 0.5, crate::plan::NeighborListAlgorithm::LinkedLists, true, true).ok()
    }
}

impl Engine for SyntheticEngine {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn prepare(&self, size: LatticeSize) -> Result<PreparedSystem, EngineFailure> {
        Ok(PreparedSystem {
            size,
            atoms: size.fcc_atoms(),
            script: None,
        })
    }

    fn run(&self, system: &PreparedSystem, request: &RunRequest) -> Result<EngineRun, EngineFailure> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if self.fail_on.contains(&system.size) {
            return Err(EngineFailure::Exit {
                status: "exit status: 1".into(),
                stderr: format!("synthetic failure on {}", system.size),
            });
        }

        let mut work = self.cost_per_atom_step.as_secs_f64() * request.steps as f64 * system.atoms as f64;
        let plan = if request.autotune {
            work /= self.autotune_speedup.max(f64::MIN_POSITIVE);
            Self::tuned_plan()
        } else {
            request.plan
        };
        let elapsed = Duration::try_from_secs_f64(work)
            .ok()
            .and_then(|work| work.checked_add(self.overhead))
            .ok_or_else(|| EngineFailure::Protocol(format!("run of {} steps is too long to time", request.steps)))?;
        if self.sleep {
            std::thread::sleep(elapsed);
        }

        Ok(EngineRun {
            steps: request.steps,
            elapsed,
            diagnostics: self.rebuild_every.map(|every| NeighborListDiagnostics {
                rebuilds: request.steps / every.max(1),
                overflow: self.overflow,
            }),
            plan,
        })
    }

    fn supports_autotune(&self) -> bool {
        true
    }
}
