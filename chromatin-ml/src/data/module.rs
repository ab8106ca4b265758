//! Data module descriptors matched to each architecture.

use crate::config::TrialSettings;
use crate::data::source::LabelTable;
use crate::error::MlError;
use crate::models::{Architecture, ModelSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SPLIT_EXTENSIONS: [&str; 2] = ["tsv", "csv"];

/// Data pipeline for one architecture. The worker owns tokenization and
/// batching; this side only describes it and inspects the train labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "module")]
pub enum DataModuleSpec {
    #[serde(rename = "DNABERT")]
    Dnabert {
        data_path: PathBuf,
        batch_size: usize,
        language_model_name: String,
        num_workers: usize,
    },
    #[serde(rename = "GPN")]
    Gpn {
        data_path: PathBuf,
        batch_size: usize,
        pretrained_model_path: PathBuf,
        num_workers: usize,
        max_length: usize,
    },
    #[serde(rename = "DeepSEA")]
    DeepSea {
        data_path: PathBuf,
        batch_size: usize,
        num_workers: usize,
    },
}

/// Result of [`DataModuleSpec::prepare_data`].
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub train: LabelTable,
    pub split_paths: Vec<(Split, PathBuf)>,
}

impl PreparedData {
    pub fn feature_names(&self) -> Vec<String> {
        self.train.feature_names()
    }
}

impl DataModuleSpec {
    /// Build the data module matching `spec`.
    pub fn for_model(spec: &ModelSpec, settings: &TrialSettings) -> Self {
        let data_path = settings.data_path.clone();
        match &spec.architecture {
            Architecture::Dnabert {
                language_model_name,
            } => DataModuleSpec::Dnabert {
                data_path,
                batch_size: spec.batch_size,
                language_model_name: language_model_name.clone(),
                num_workers: spec.num_workers,
            },
            Architecture::Gpn {
                pretrained_model_path,
                max_length,
            } => DataModuleSpec::Gpn {
                data_path,
                batch_size: spec.batch_size,
                pretrained_model_path: pretrained_model_path.clone(),
                num_workers: spec.num_workers,
                max_length: *max_length,
            },
            Architecture::DeepSea { .. } => DataModuleSpec::DeepSea {
                data_path,
                batch_size: spec.batch_size,
                num_workers: spec.num_workers,
            },
        }
    }

    pub fn data_path(&self) -> &Path {
        match self {
            DataModuleSpec::Dnabert { data_path, .. }
            | DataModuleSpec::Gpn { data_path, .. }
            | DataModuleSpec::DeepSea { data_path, .. } => data_path,
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            DataModuleSpec::Dnabert { batch_size, .. }
            | DataModuleSpec::Gpn { batch_size, .. }
            | DataModuleSpec::DeepSea { batch_size, .. } => *batch_size,
        }
    }

    pub fn num_workers(&self) -> usize {
        match self {
            DataModuleSpec::Dnabert { num_workers, .. }
            | DataModuleSpec::Gpn { num_workers, .. }
            | DataModuleSpec::DeepSea { num_workers, .. } => *num_workers,
        }
    }

    /// Locate the file for `split` under the data path.
    pub fn split_path(&self, split: Split) -> Result<PathBuf, MlError> {
        let dir = self.data_path();
        SPLIT_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{ext}", split.as_str())))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                MlError::dataset(format!(
                    "missing {split} split under {} (expected {split}.tsv or {split}.csv)",
                    dir.display()
                ))
            })
    }

    /// Check every split is present and load the train labels.
    pub fn prepare_data(&self, metadata_columns: &[String]) -> Result<PreparedData, MlError> {
        let split_paths = Split::ALL
            .iter()
            .map(|&split| self.split_path(split).map(|p| (split, p)))
            .collect::<Result<Vec<_>, _>>()?;
        for (split, path) in &split_paths {
            debug!(split = %split, path = %path.display(), "Found dataset split");
        }

        let train_path = &split_paths[0].1;
        let train = LabelTable::load(train_path, metadata_columns)?;
        info!(
            rows = train.row_count(),
            features = train.feature_names().len(),
            "Loaded train labels"
        );
        Ok(PreparedData { train, split_paths })
    }
}
