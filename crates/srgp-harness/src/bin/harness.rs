//! CLI entrypoint for the SRGP simulation harness.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use srgp_engine::{MechanismKind, MtpConfig};
use srgp_harness::structured_log::{ArtifactIndex, LogEmitter};
use srgp_harness::{
    HarnessError, SimulationParams, SimulationReport, simulate_adversary, simulate_null,
};
use tracing_subscriber::EnvFilter;

/// Monte Carlo tooling for the SRGP multiple-testing engine.
#[derive(Debug, Parser)]
#[command(name = "srgp-harness")]
#[command(about = "Family-wise error simulations for sequential model-update testing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Simulate i.i.d. null candidates and report the empirical FWER.
    SimulateNull(SimulateArgs),
    /// Simulate a developer adaptively reusing one held-out set.
    SimulateAdversary(SimulateArgs),
    /// Print the effective configuration (defaults, `--config`, then `SRGP_*`).
    ShowConfig {
        /// Optional JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Mechanism (`graphical_ffs`, `graphical_bonf`, `bonferroni`, `binary`, `graphical_par`).
    #[arg(long, default_value = "graphical_ffs")]
    mechanism: String,
    /// Decisions per run.
    #[arg(long, default_value_t = 20)]
    queries: usize,
    /// Monte Carlo repetitions.
    #[arg(long, default_value_t = 1000)]
    reps: usize,
    /// Held-out units per candidate.
    #[arg(long, default_value_t = 100)]
    units: usize,
    /// Data-generator seed.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Optional JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Structured JSONL log path.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Output report path (if omitted, prints to stdout).
    #[arg(long)]
    output: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<MtpConfig, HarnessError> {
    let base = match path {
        None => MtpConfig::default(),
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| HarnessError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|source| HarnessError::Json {
                path: path.to_path_buf(),
                source,
            })?
        }
    };
    Ok(base.from_env()?)
}

fn write_output(path: Option<&Path>, body: &str) -> Result<(), HarnessError> {
    match path {
        Some(path) => {
            std::fs::write(path, body).map_err(|source| HarnessError::Write {
                path: path.to_path_buf(),
                source,
            })?;
            eprintln!("Wrote report to {}", path.display());
        }
        None => println!("{body}"),
    }
    Ok(())
}

type Simulator = fn(
    MtpConfig,
    MechanismKind,
    SimulationParams,
    Option<&mut LogEmitter>,
) -> Result<SimulationReport, HarnessError>;

fn run_simulation(args: SimulateArgs, simulate: Simulator) -> Result<(), HarnessError> {
    let config = load_config(args.config.as_deref())?;
    let kind = MechanismKind::from_str_loose(&args.mechanism)?;
    let params = SimulationParams {
        queries: args.queries,
        reps: args.reps,
        units: args.units,
        seed: args.seed,
    };
    let run_id = format!("{kind}-s{}", args.seed);

    let mut emitter = match &args.log {
        Some(path) => Some(LogEmitter::to_file(path, &run_id).map_err(|source| {
            HarnessError::Write {
                path: path.clone(),
                source,
            }
        })?),
        None => None,
    };
    let report = simulate(config, kind, params, emitter.as_mut())?;
    drop(emitter);

    let body = serde_json::to_string_pretty(&report)?;
    write_output(args.output.as_deref(), &body)?;

    eprintln!(
        "{} over {} runs: FWER {:.4} (upper {:.4}), {:.3} approvals/run",
        report.mechanism,
        report.params.reps,
        report.empirical_fwer,
        report.fwer_upper_bound,
        report.mean_approvals,
    );

    if let (Some(log), Some(output)) = (&args.log, &args.output) {
        let mut index = ArtifactIndex::new(run_id);
        for (path, kind) in [(log, "jsonl_log"), (output, "simulation_report")] {
            index.add_file(path, kind).map_err(|source| HarnessError::Read {
                path: path.clone(),
                source,
            })?;
        }
        let index_path = output.with_extension("artifacts.json");
        std::fs::write(&index_path, index.to_json()?).map_err(|source| HarnessError::Write {
            path: index_path.clone(),
            source,
        })?;
        eprintln!("Wrote artifact index to {}", index_path.display());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("srgp_engine=warn,srgp_harness=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::SimulateNull(args) => run_simulation(args, simulate_null)?,
        Command::SimulateAdversary(args) => run_simulation(args, simulate_adversary)?,
        Command::ShowConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
