//! HIPPOCAMPUS LOCALIZATION: launch planning and offline replay for the
//! vehicle localization EKF.
//!
//! - `plan` resolves the launch arguments of one vehicle and prints the nodes
//!   and parameters it would bring up.
//! - `run` replays a measurement CSV through the estimator of that launch.
//! - `simulate` generates a noisy constant-velocity track and replays it.
//! - `config` writes a template estimator configuration (TOML/JSON/YAML).
//!
//! The estimator configuration is read from `--config` when given, otherwise
//! defaults are used. The launch's `process_model` always wins over the one in
//! the file.

mod common;

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use common::{create_parent_dir, init_logger, validate_input_file};
use log::{info, warn};

use hippocampus::config::EstimatorConfig;
use hippocampus::error::EstimatorError;
use hippocampus::launch::{LOCALIZATION_NODE, LaunchArgs, LaunchPlan};
use hippocampus::localization::Localization;
use hippocampus::node::{Node, ParameterServer};
use hippocampus::process::ProcessModel;
use hippocampus::sim::{
    MeasurementRecord, NavigationResult, TrackConfig, rms_position_error, run_replay,
    synthesize_track,
};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Launch planning and offline replay for the HippoCampus localization EKF."
)]
struct Cli {
    /// Estimator configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(about = "Resolve the launch arguments and print the launch plan")]
    Plan(PlanArgs),
    #[command(about = "Replay a measurement CSV through the localization EKF")]
    Run(RunArgs),
    #[command(about = "Generate a synthetic track and replay it")]
    Simulate(SimulateArgs),
    #[command(name = "config", about = "Generate a template estimator configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct PlanArgs {
    #[command(flatten)]
    launch: LaunchArgs,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    #[command(flatten)]
    launch: LaunchArgs,

    /// Measurement CSV (time,kind,x,y,z,qw,qx,qy,qz,noise_std,orientation_noise_std)
    #[arg(short, long)]
    input: PathBuf,

    /// Output CSV with one estimate per predict row
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    #[command(flatten)]
    launch: LaunchArgs,

    /// Output CSV with one estimate per sample
    #[arg(short, long)]
    output: PathBuf,

    /// Also write the generated measurements to this CSV
    #[arg(long)]
    measurements: Option<PathBuf>,

    /// Track duration (s)
    #[arg(long, default_value_t = 10.0)]
    duration: f64,

    /// Measurement rate (Hz)
    #[arg(long, default_value_t = 10.0)]
    rate: f64,

    /// Position noise standard deviation (m)
    #[arg(long, default_value_t = 0.05)]
    position_noise: f64,

    /// Orientation noise standard deviation (rad)
    #[arg(long, default_value_t = 0.01)]
    orientation_noise: f64,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output file; the extension selects the format
    #[arg(short, long, default_value = "localization.toml")]
    output: PathBuf,

    /// Process model written into the template
    #[arg(long, value_enum, default_value_t = ProcessModel::Simple)]
    process_model: ProcessModel,
}

fn load_config(path: Option<&PathBuf>) -> Result<EstimatorConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            info!("Loading estimator configuration from {}", path.display());
            let config = EstimatorConfig::from_file(path)?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(EstimatorConfig::default()),
    }
}

/// Bring up the launch's parameters and build the estimator the localization node would run.
fn start_localization(
    launch: &LaunchArgs,
    config_path: Option<&PathBuf>,
) -> Result<(LaunchPlan, Localization), Box<dyn Error>> {
    let plan = launch.resolve()?;
    let params = ParameterServer::new();
    plan.apply(&params);

    let node = Node::new(LOCALIZATION_NODE, &plan.namespace, params);
    let vehicle_name: String = node.get_param("vehicle_name", None).ok_or_else(|| {
        EstimatorError::Configuration("parameter 'vehicle_name' is required".to_string())
    })?;
    let mut config = load_config(config_path)?;
    if config.process_model != plan.process_model {
        warn!(
            "Launch selects the {} process model, overriding {} from the configuration",
            plan.process_model, config.process_model
        );
        config.process_model = plan.process_model;
    }
    let localization = Localization::new(&vehicle_name, config)?;
    Ok((plan, localization))
}

fn write_results(results: &[NavigationResult], output: &PathBuf) -> Result<(), Box<dyn Error>> {
    create_parent_dir(output)?;
    NavigationResult::to_csv(results, output)?;
    info!("Wrote {} estimates to {}", results.len(), output.display());
    Ok(())
}

fn run_plan(args: &PlanArgs) -> Result<(), Box<dyn Error>> {
    let plan = args.launch.resolve()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", plan);
    }
    Ok(())
}

fn run_replay_file(args: &RunArgs, config_path: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    validate_input_file(&args.input)?;
    let (plan, mut localization) = start_localization(&args.launch, config_path)?;
    let records = MeasurementRecord::from_csv(&args.input)?;
    info!(
        "Replaying {} records from {} for {}",
        records.len(),
        args.input.display(),
        plan.namespace
    );
    let results = run_replay(&mut localization, &records);
    info!("Replay finished: {:?}", localization.stats());
    write_results(&results, &args.output)
}

fn run_simulation(args: &SimulateArgs, config_path: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let (plan, mut localization) = start_localization(&args.launch, config_path)?;
    let track = synthesize_track(&TrackConfig {
        duration_s: args.duration,
        rate_hz: args.rate,
        position_noise_std: args.position_noise,
        orientation_noise_std: args.orientation_noise,
        seed: args.seed,
        ..Default::default()
    })?;
    if let Some(path) = &args.measurements {
        create_parent_dir(path)?;
        MeasurementRecord::to_csv(&track.records, path)?;
    }
    info!(
        "Simulating {} samples for {} with the {} process model",
        track.truth.len(),
        plan.namespace,
        plan.process_model
    );
    let results = run_replay(&mut localization, &track.records);
    match rms_position_error(&results, &track.truth) {
        Some(rms) => info!("RMS position error: {:.4} m", rms),
        None => warn!("No estimate matched a truth sample"),
    }
    write_results(&results, &args.output)
}

fn create_config_file(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    create_parent_dir(&args.output)?;
    EstimatorConfig::default()
        .with_process_model(args.process_model)
        .to_file(&args.output)?;
    info!("Wrote template configuration to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::Plan(args) => run_plan(args),
        Command::Run(args) => run_replay_file(args, cli.config.as_ref()),
        Command::Simulate(args) => run_simulation(args, cli.config.as_ref()),
        Command::CreateConfig(args) => create_config_file(args),
    }
}
