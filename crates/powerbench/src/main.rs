use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use powerbench::format::{format_error, format_frame, format_success, format_summary, format_warning};
use powerbench::{build_engine, probe_meter, run_benchmark, Backend, Integrator, RunConfig, Sources};
use powerbench_profiler::{MeterConfig, ShutdownSignal};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "powerbench", version, about = "MD benchmark sweeps with GPU and wall-power telemetry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark sweep while logging power once per second
    Run(RunArgs),
    /// Read the power meter and print every value
    Probe(ProbeArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Identifier for this run; reusing one overwrites its output files
    identifier: String,
    /// Two small systems and short idle periods
    #[arg(long)]
    debug: bool,
    #[arg(long, value_enum, default_value_t = Backend::Lammps)]
    backend: Backend,
    /// Add an engine-autotuned run after each calibrated one
    #[arg(long)]
    autotune: bool,
    /// Use the engine's GPU acceleration
    #[arg(long)]
    gpu_accel: bool,
    /// Serial port of the power meter
    #[arg(long)]
    port: Option<String>,
    /// Sizes file (default: nxyzs.txt)
    #[arg(long)]
    sizes: Option<PathBuf>,
    /// Directory for the CSV files (default: data)
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    mpi_ranks: Option<u32>,
    /// Harness command for the gamdpy backend
    #[arg(long)]
    harness: Option<String>,
    #[arg(long, value_enum)]
    integrator: Option<Integrator>,
    /// Do not sample the wall-power meter
    #[arg(long)]
    no_meter: bool,
    /// Do not sample GPU power
    #[arg(long)]
    no_gpu: bool,
}

#[derive(Args)]
struct ProbeArgs {
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,
    /// Number of readings, one second apart
    #[arg(long, default_value_t = 5)]
    count: u64,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info,powerbench=debug" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Raise `shutdown` on Ctrl-C.
fn stop_on_interrupt(shutdown: &ShutdownSignal) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping after the current configuration");
            shutdown.raise();
        }
    });
}

fn run_config(args: RunArgs) -> RunConfig {
    let mut config = if args.debug {
        RunConfig::debug(args.identifier)
    } else {
        RunConfig::full(args.identifier)
    };
    config.backend = args.backend;
    config.autotune = args.autotune;
    config.gpu_accel = args.gpu_accel;
    if let Some(sizes) = args.sizes {
        config.sizes_file = sizes;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(ranks) = args.mpi_ranks {
        config.mpi_ranks = ranks;
    }
    if let Some(harness) = args.harness {
        config.harness = harness;
    }
    if let Some(integrator) = args.integrator {
        config.integrator = integrator;
    }
    if let (Some(port), Some(meter)) = (args.port, config.meter.as_mut()) {
        meter.port = port;
    }
    if args.no_meter {
        config.meter = None;
    }
    if args.no_gpu {
        config.gpu = None;
    }
    config
}

/// Returns the process exit status for a sweep that did not fail.
async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let config = run_config(args);
    let shutdown = ShutdownSignal::new();
    stop_on_interrupt(&shutdown);

    let engine = build_engine(&config);
    let sources = Sources::from_config(&config);
    let outcome = run_benchmark(&config, engine, sources, shutdown)
        .await
        .with_context(|| format!("benchmark run {:?} on {} failed", config.identifier, config.backend))?;

    print!("{}", format_summary(&outcome.report));
    println!(
        "{}",
        format_success(&format!("telemetry written to {}", outcome.telemetry_path.display()))
    );
    if let Some(path) = &outcome.results_path {
        println!("{}", format_success(&format!("results written to {}", path.display())));
    }
    if outcome.report.interrupted {
        eprintln!(
            "{}",
            format_warning(&format!(
                "sweep interrupted after {} configuration(s)",
                outcome.report.cases.len()
            ))
        );
    }
    Ok(outcome.exit_code())
}

async fn probe(args: ProbeArgs) -> anyhow::Result<i32> {
    let shutdown = ShutdownSignal::new();
    stop_on_interrupt(&shutdown);

    let meter = MeterConfig {
        port: args.port.clone(),
        ..MeterConfig::default()
    };
    let mut failures = 0u64;
    let taken = probe_meter(meter, args.count, Duration::from_secs(1), &shutdown, |index, reading| {
        match reading {
            Ok(frame) => println!("{}", format_frame(index, &frame)),
            Err(e) => {
                failures += 1;
                eprintln!("{}", format_warning(&e.to_string()));
            }
        }
    })
    .await;

    if taken > 0 && failures == taken {
        bail!("no valid reading from {}", args.port);
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let debug = matches!(&cli.command, Commands::Run(args) if args.debug);
    init_tracing(debug);

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Probe(args) => probe(args).await,
    };
    match result {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{}", format_error(&format!("{e:#}")));
            process::exit(1);
        }
    }
}
