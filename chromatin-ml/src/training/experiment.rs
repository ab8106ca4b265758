//! Experiment tracking for training runs.
//!
//! Every run gets a numbered directory `<save_dir>/version_<N>` holding the
//! run record, the hyperparameters and a JSON-lines metric stream.

use crate::config::LoggerConfig;
use crate::error::MlError;
use crate::persistence::{append_jsonl, atomic_write_json};
use crate::training::reproducibility::EnvironmentSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Training status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Sink for run metadata and metrics.
pub trait RunLogger: Send {
    /// Identifier of this run, used in checkpoint paths.
    fn version(&self) -> String;

    /// Directory that holds this run's files.
    fn run_dir(&self) -> &Path;

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> Result<(), MlError>;

    fn log_metrics(&mut self, step: u64, metrics: &BTreeMap<String, f64>) -> Result<(), MlError>;

    /// Record where a checkpoint was written.
    fn log_checkpoint(&mut self, path: &Path) -> Result<(), MlError>;

    fn finalize(&mut self, status: TrainingStatus) -> Result<(), MlError>;
}

/// Persistent description of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub project: String,
    pub name: String,
    pub version: u32,
    pub status: TrainingStatus,
    pub hyperparams: serde_json::Value,
    pub checkpoint_path: Option<PathBuf>,
    pub environment: Option<EnvironmentSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct MetricLine<'a> {
    step: u64,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    metrics: &'a BTreeMap<String, f64>,
}

/// Run logger writing plain files under a versioned directory.
pub struct JsonlRunLogger {
    record: RunRecord,
    run_dir: PathBuf,
    log_model: bool,
}

impl JsonlRunLogger {
    /// Open a fresh run under `config.save_dir` using the next free version.
    pub fn create(config: &LoggerConfig) -> Result<Self, MlError> {
        std::fs::create_dir_all(&config.save_dir)?;
        let version = next_version(&config.save_dir)?;
        let run_dir = config.save_dir.join(format!("version_{version}"));
        std::fs::create_dir_all(&run_dir)?;

        let now = Utc::now();
        let record = RunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project: config.project.clone(),
            name: config.run_name.clone(),
            version,
            status: TrainingStatus::Pending,
            hyperparams: serde_json::Value::Object(serde_json::Map::new()),
            checkpoint_path: None,
            environment: Some(EnvironmentSnapshot::capture()),
            created_at: now,
            updated_at: now,
        };
        let logger = Self {
            record,
            run_dir,
            log_model: config.log_model,
        };
        logger.save_record()?;
        tracing::info!(
            project = %config.project,
            name = %config.run_name,
            version,
            "Opened training run"
        );
        Ok(logger)
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    fn save_record(&self) -> Result<(), MlError> {
        atomic_write_json(&self.run_dir.join("run.json"), &self.record)
    }

    fn touch(&mut self, status: TrainingStatus) -> Result<(), MlError> {
        self.record.status = status;
        self.record.updated_at = Utc::now();
        self.save_record()
    }
}

impl RunLogger for JsonlRunLogger {
    fn version(&self) -> String {
        self.record.version.to_string()
    }

    fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> Result<(), MlError> {
        self.record.hyperparams = params.clone();
        atomic_write_json(&self.run_dir.join("hparams.json"), params)?;
        self.touch(TrainingStatus::Running)
    }

    fn log_metrics(&mut self, step: u64, metrics: &BTreeMap<String, f64>) -> Result<(), MlError> {
        let line = MetricLine {
            step,
            timestamp: Utc::now(),
            metrics,
        };
        append_jsonl(&self.run_dir.join("metrics.jsonl"), &line)
    }

    fn log_checkpoint(&mut self, path: &Path) -> Result<(), MlError> {
        self.record.checkpoint_path = Some(path.to_path_buf());
        if self.log_model {
            if let Some(file_name) = path.file_name() {
                let target = self.run_dir.join("artifacts").join(file_name);
                if target != path {
                    std::fs::create_dir_all(target.parent().unwrap_or(&self.run_dir))?;
                    std::fs::copy(path, &target)?;
                }
            }
        }
        let status = self.record.status.clone();
        self.touch(status)
    }

    fn finalize(&mut self, status: TrainingStatus) -> Result<(), MlError> {
        tracing::info!(version = self.record.version, status = ?status, "Closing training run");
        self.touch(status)
    }
}

/// One past the highest existing `version_<N>` directory.
pub fn next_version(save_dir: &Path) -> Result<u32, MlError> {
    if !save_dir.exists() {
        return Ok(0);
    }
    let mut next = 0;
    for entry in std::fs::read_dir(save_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(n) = name
            .to_str()
            .and_then(|n| n.strip_prefix("version_"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            next = next.max(n + 1);
        }
    }
    Ok(next)
}
