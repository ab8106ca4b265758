//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use chromatin_ml::config::{TrialRunnerConfig, WORKSPACE_CONFIG_FILE, load_config};
use chromatin_ml::runtime::WorkerRuntime;
use chromatin_ml::{StorageUrl, Study};
use std::path::Path;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, config_file),
        Commands::Detect => handle_detect().await,
        Commands::Export { output } => handle_export(workspace, config_file, output.as_deref()),
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join(WORKSPACE_CONFIG_FILE);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&TrialRunnerConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), config_file)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn handle_detect() -> anyhow::Result<()> {
    let info = WorkerRuntime::detect().await?;
    println!("Python: {} ({})", info.version, info.path.display());
    match &info.venv_path {
        Some(venv) => println!("Virtualenv: {}", venv.display()),
        None => println!("Virtualenv: none"),
    }
    Ok(())
}

/// Write the trial history of an existing study without running trials.
fn handle_export(
    workspace: &Path,
    config_file: Option<&Path>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(Some(workspace), config_file)?;
    let url = StorageUrl::parse(&config.study.storage, workspace)?;
    let study = Study::load(&config.study.name, &url)?;
    let path = workspace.join(output.unwrap_or(config.study.export_path.as_path()));
    study.trials_dataframe()?.export_tsv(&path)?;
    println!("Exported trials to {}", path.display());
    Ok(())
}
