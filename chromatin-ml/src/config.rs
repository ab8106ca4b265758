//! Configuration for chromatin trial runs.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace `chromatin.toml` -> environment -> explicit overrides.

use crate::data::PosWeightStrategy;
use crate::error::MlError;
use crate::models::ModelKind;
use crate::study::{ParamDistribution, StudyDirection};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the workspace-level configuration.
pub const WORKSPACE_CONFIG_FILE: &str = "chromatin.toml";

/// Top-level configuration of a trial run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrialRunnerConfig {
    /// Hyperparameter study settings.
    #[serde(default)]
    pub study: StudyConfig,
    /// Per-trial model and data settings.
    #[serde(default)]
    pub trial: TrialSettings,
    /// Experiment tracker settings.
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Training worker process settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Hyperparameter study configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    #[serde(default = "default_study_name")]
    pub name: String,
    /// Storage URL; only `sqlite:///` URLs are supported.
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default)]
    pub direction: StudyDirection,
    #[serde(default = "default_true")]
    pub load_if_exists: bool,
    #[serde(default = "default_n_trials")]
    pub n_trials: usize,
    /// Where the tab-separated trial history is written.
    #[serde(default = "default_export_path")]
    pub export_path: PathBuf,
    /// Parameters sampled for every trial. Empty means the objective runs
    /// with its fixed presets.
    #[serde(default)]
    pub search_space: BTreeMap<String, ParamDistribution>,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            name: default_study_name(),
            storage: default_storage(),
            direction: StudyDirection::default(),
            load_if_exists: true,
            n_trials: default_n_trials(),
            export_path: default_export_path(),
            search_space: BTreeMap::new(),
        }
    }
}

fn default_study_name() -> String {
    "chromatin".to_string()
}

fn default_storage() -> String {
    format!("sqlite:///{}.sqlite3", default_study_name())
}

fn default_n_trials() -> usize {
    1
}

fn default_export_path() -> PathBuf {
    PathBuf::from("trials_dataframe.tsv")
}

fn default_true() -> bool {
    true
}

/// Model and data settings applied to each trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSettings {
    /// Which of the three candidate architectures to train.
    #[serde(default)]
    pub module: ModelKind,
    /// Number of chromatin features predicted.
    #[serde(default = "default_n_output")]
    pub n_output: usize,
    /// Floating point precision handed to the worker (16 or 32).
    #[serde(default = "default_precision")]
    pub precision: u8,
    /// Data-parallel strategy name handed to the worker.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Raw device selection (`"2"`, `"-1"`, `"0,1"`). `None` lets the worker decide.
    #[serde(default)]
    pub devices: Option<String>,
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default)]
    pub pos_weight_strategy: PosWeightStrategy,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Metric watched by early stopping and the plateau scheduler.
    #[serde(default = "default_monitor")]
    pub monitor: String,
    /// Metric returned to the study.
    #[serde(default = "default_test_metric")]
    pub test_metric: String,
    #[serde(default = "default_dnabert_model")]
    pub dnabert_language_model_name: String,
    #[serde(default = "default_gpn_pretrained_path")]
    pub gpn_pretrained_model_path: PathBuf,
    /// Columns of the label tables that are not chromatin features.
    #[serde(default = "default_metadata_columns")]
    pub metadata_columns: Vec<String>,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            module: ModelKind::default(),
            n_output: default_n_output(),
            precision: default_precision(),
            strategy: default_strategy(),
            devices: None,
            data_path: default_data_path(),
            pos_weight_strategy: PosWeightStrategy::default(),
            seed: default_seed(),
            monitor: default_monitor(),
            test_metric: default_test_metric(),
            dnabert_language_model_name: default_dnabert_model(),
            gpn_pretrained_model_path: default_gpn_pretrained_path(),
            metadata_columns: default_metadata_columns(),
        }
    }
}

fn default_n_output() -> usize {
    109
}

fn default_precision() -> u8 {
    16
}

fn default_strategy() -> String {
    "dp".to_string()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("../../data/chromatin/datasets/")
}

fn default_seed() -> u64 {
    42
}

fn default_monitor() -> String {
    "val/neg_median_auroc".to_string()
}

fn default_test_metric() -> String {
    "test/neg_median_auroc".to_string()
}

fn default_dnabert_model() -> String {
    "armheb/DNA_bert_6".to_string()
}

fn default_gpn_pretrained_path() -> PathBuf {
    PathBuf::from("../mlm/results_512_convnet_only_athaliana_lower_lr_v2/checkpoint-80000/")
}

fn default_metadata_columns() -> Vec<String> {
    ["chrom", "start", "end", "strand", "seq"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Experiment tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_run_name")]
    pub run_name: String,
    /// Copy checkpoints into the run directory.
    #[serde(default)]
    pub log_model: bool,
    /// Root for run directories and checkpoints.
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            run_name: default_run_name(),
            log_model: false,
            save_dir: default_save_dir(),
        }
    }
}

fn default_project() -> String {
    "GPN_Chromatin".to_string()
}

fn default_run_name() -> String {
    "ConvNet_512_ft_lowlr".to_string()
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("lightning_logs")
}

/// Training worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_python")]
    pub python_path: PathBuf,
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// Worker entry point, relative to the workspace.
    #[serde(default = "default_worker_script")]
    pub script: PathBuf,
    /// Upper bound for a single worker request (one epoch, one prediction pass).
    #[serde(default = "default_worker_timeout")]
    pub timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            python_path: default_python(),
            venv_path: None,
            script: default_worker_script(),
            timeout_secs: default_worker_timeout(),
        }
    }
}

fn default_python() -> PathBuf {
    PathBuf::from("python3")
}

fn default_worker_script() -> PathBuf {
    PathBuf::from("train_worker.py")
}

fn default_worker_timeout() -> u64 {
    6 * 3600
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `CHROMATIN_`)
/// 2. The explicit `config_file`, or else the workspace `chromatin.toml`
/// 3. User config (`~/.config/chromatin/config.toml`)
/// 4. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<TrialRunnerConfig, MlError> {
    let mut figment = Figment::from(Serialized::defaults(TrialRunnerConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("org", "gpn", "chromatin") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    match (config_file, workspace) {
        (Some(file), _) => {
            if !file.exists() {
                return Err(MlError::Config(format!(
                    "config file not found: {}",
                    file.display()
                )));
            }
            figment = figment.merge(Toml::file(file));
        }
        (None, Some(ws)) => {
            let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
            if ws_config.exists() {
                figment = figment.merge(Toml::file(&ws_config));
            }
        }
        (None, None) => {}
    }

    // CHROMATIN_TRIAL__MODULE, CHROMATIN_STUDY__N_TRIALS, ...
    figment = figment.merge(Env::prefixed("CHROMATIN_").split("__"));

    figment.extract().map_err(|e| MlError::from(Box::new(e)))
}
