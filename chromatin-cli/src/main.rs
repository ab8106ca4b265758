//! chromatin-trial: run hyperparameter-search trials for chromatin classifiers.
//!
//! Each invocation loads the layered configuration, opens (or resumes) the
//! SQLite-backed study, runs the requested trials through the training
//! worker and exports the trial history.

mod commands;

use chromatin_ml::config::{TrialRunnerConfig, load_config};
use chromatin_ml::training::{Devices, WorkerLauncher};
use chromatin_ml::{ChromatinObjective, ModelKind, StorageUrl, Study, WorkerRuntime};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Train and evaluate chromatin-state classifiers as study trials
#[derive(Parser, Debug)]
#[command(name = "chromatin-trial", version, about, long_about = None)]
struct Cli {
    /// Devices to train on: a count, -1 for all, or a comma-separated list
    #[arg(long, allow_hyphen_values = true)]
    gpus: Option<String>,

    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model to train: DNABERT, GPN or DeepSEA
    #[arg(short, long)]
    module: Option<String>,

    /// Number of trials to run
    #[arg(short = 'n', long)]
    n_trials: Option<usize>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Probe for a Python interpreter for the training worker
    Detect,
    /// Export the trial history of the configured study
    Export {
        /// Output path (defaults to study.export_path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default chromatin.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

/// Apply command-line flags on top of the loaded configuration.
fn apply_cli_overrides(config: &mut TrialRunnerConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(gpus) = &cli.gpus {
        gpus.parse::<Devices>()?;
        config.trial.devices = Some(gpus.clone());
    }
    if let Some(module) = &cli.module {
        config.trial.module = module.parse::<ModelKind>()?;
    }
    if let Some(n_trials) = cli.n_trials {
        config.study.n_trials = n_trials;
    }
    Ok(())
}

async fn run_study(config: TrialRunnerConfig, workspace: &Path) -> anyhow::Result<()> {
    let url = StorageUrl::parse(&config.study.storage, workspace)?;
    let mut study = Study::create(
        &config.study.name,
        &url,
        config.study.direction,
        config.study.load_if_exists,
    )?
    .with_sampler_seed(config.trial.seed);

    let runtime = WorkerRuntime::with_config(&config.worker, workspace.to_path_buf());
    let n_trials = config.study.n_trials;
    let export_path = workspace.join(&config.study.export_path);
    let mut objective = ChromatinObjective::new(
        config,
        Box::new(WorkerLauncher::new(runtime)),
        workspace.to_path_buf(),
    );

    let outcome = study.optimize(&mut objective, n_trials).await;

    // Export whatever was recorded, including a failed trial.
    study.trials_dataframe()?.export_tsv(&export_path)?;
    tracing::info!(path = %export_path.display(), "Exported trial history");
    outcome?;

    let best = study.best_trial()?;
    println!(
        "Best trial {}: value {}",
        best.number,
        best.value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
    );
    println!("{}", serde_json::to_string_pretty(&best.params)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let mut cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("org", "gpn", "chromatin")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "chromatin-trial.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    // Resolve workspace
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if let Some(command) = cli.command.take() {
        return commands::handle_command(command, &workspace, cli.config.as_deref()).await;
    }

    let mut config = load_config(Some(&workspace), cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    apply_cli_overrides(&mut config, &cli)?;

    run_study(config, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("chromatin-trial").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_gpus_flag_accepts_all_devices() {
        let cli = parse(&["--gpus", "-1"]);
        let mut config = TrialRunnerConfig::default();
        apply_cli_overrides(&mut config, &cli).unwrap();
        assert_eq!(config.trial.devices.as_deref(), Some("-1"));
    }

    #[test]
    fn test_overrides_module_and_trials() {
        let cli = parse(&["--module", "deepsea", "-n", "4"]);
        let mut config = TrialRunnerConfig::default();
        apply_cli_overrides(&mut config, &cli).unwrap();
        assert_eq!(config.trial.module, ModelKind::DeepSea);
        assert_eq!(config.study.n_trials, 4);
        assert_eq!(config.trial.devices, None);
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let mut config = TrialRunnerConfig::default();
        assert!(apply_cli_overrides(&mut config, &parse(&["--gpus", "many"])).is_err());
        assert!(apply_cli_overrides(&mut config, &parse(&["--module", "BERT"])).is_err());
    }

    #[test]
    fn test_config_init_subcommand_parses() {
        let cli = parse(&["config", "init"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Config {
                action: ConfigAction::Init
            })
        ));
    }
}
