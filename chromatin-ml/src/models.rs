//! Candidate architectures and their hyperparameter presets.
//!
//! Each [`ModelKind`] maps to exactly one [`ModelSpec`]. The data module
//! for a trial is derived from the same preset.

use crate::config::TrialSettings;
use crate::data::PosWeightStrategy;
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Effective batch size DNABERT reaches through gradient accumulation.
const DNABERT_EFFECTIVE_BATCH: usize = 256;

/// The three candidate architectures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "DNABERT", alias = "dnabert")]
    Dnabert,
    #[default]
    #[serde(rename = "GPN", alias = "gpn")]
    Gpn,
    #[serde(rename = "DeepSEA", alias = "deepsea")]
    DeepSea,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Dnabert, ModelKind::Gpn, ModelKind::DeepSea];

    /// Identifier understood by the training worker.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Dnabert => "DNABERT",
            ModelKind::Gpn => "GPN",
            ModelKind::DeepSea => "DeepSEA",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                MlError::invalid_input(format!(
                    "unknown model module '{s}' (expected DNABERT, GPN or DeepSEA)"
                ))
            })
    }
}

/// Architecture-specific constructor arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "module")]
pub enum Architecture {
    #[serde(rename = "DNABERT")]
    Dnabert { language_model_name: String },
    #[serde(rename = "GPN")]
    Gpn {
        pretrained_model_path: PathBuf,
        max_length: usize,
    },
    #[serde(rename = "DeepSEA")]
    DeepSea { n_input: usize },
}

/// Hyperparameter preset for one architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub kind: ModelKind,
    pub architecture: Architecture,
    pub n_output: usize,
    pub batch_size: usize,
    pub accumulate_grad_batches: usize,
    pub num_workers: usize,
    pub max_epochs: usize,
    pub lr: f64,
    pub reduce_lr_on_plateau_patience: usize,
}

impl ModelSpec {
    /// Select the preset for `kind`.
    pub fn for_kind(kind: ModelKind, settings: &TrialSettings) -> Self {
        match kind {
            ModelKind::Dnabert => {
                let batch_size = 12;
                Self {
                    kind,
                    architecture: Architecture::Dnabert {
                        language_model_name: settings.dnabert_language_model_name.clone(),
                    },
                    n_output: settings.n_output,
                    batch_size,
                    accumulate_grad_batches: DNABERT_EFFECTIVE_BATCH / batch_size,
                    num_workers: 0,
                    max_epochs: 100,
                    lr: 5e-5,
                    reduce_lr_on_plateau_patience: 0,
                }
            }
            ModelKind::Gpn => Self {
                kind,
                architecture: Architecture::Gpn {
                    pretrained_model_path: settings.gpn_pretrained_model_path.clone(),
                    max_length: 1000,
                },
                n_output: settings.n_output,
                batch_size: 128,
                accumulate_grad_batches: 2,
                num_workers: 8,
                max_epochs: 100,
                lr: 5e-5,
                reduce_lr_on_plateau_patience: 0,
            },
            ModelKind::DeepSea => Self {
                kind,
                architecture: Architecture::DeepSea { n_input: 4 },
                n_output: settings.n_output,
                batch_size: 256,
                accumulate_grad_batches: 1,
                num_workers: 8,
                max_epochs: 100,
                lr: 1e-3,
                reduce_lr_on_plateau_patience: 1,
            },
        }
    }

    /// Early stopping waits through two full plateau cycles.
    pub fn early_stopping_patience(&self) -> usize {
        2 * (1 + self.reduce_lr_on_plateau_patience)
    }

    /// Assemble the constructor arguments sent to the worker.
    pub fn model_args(
        &self,
        feature_names: Vec<String>,
        pos_weight_strategy: PosWeightStrategy,
        pos_weight: Vec<f64>,
    ) -> Result<ModelArgs, MlError> {
        if feature_names.len() != pos_weight.len() {
            return Err(MlError::model(format!(
                "{} features but {} positive weights",
                feature_names.len(),
                pos_weight.len()
            )));
        }
        if feature_names.len() != self.n_output {
            tracing::warn!(
                module = %self.kind,
                n_output = self.n_output,
                features = feature_names.len(),
                "Feature count differs from configured output size"
            );
        }
        Ok(ModelArgs {
            architecture: self.architecture.clone(),
            n_output: self.n_output,
            batch_size: self.batch_size,
            accumulate_grad_batches: self.accumulate_grad_batches,
            num_workers: self.num_workers,
            lr: self.lr,
            reduce_lr_on_plateau_patience: self.reduce_lr_on_plateau_patience,
            feature_names,
            pos_weight_strategy,
            pos_weight,
        })
    }
}

/// Full model constructor arguments for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    #[serde(flatten)]
    pub architecture: Architecture,
    pub n_output: usize,
    pub batch_size: usize,
    pub accumulate_grad_batches: usize,
    pub num_workers: usize,
    pub lr: f64,
    pub reduce_lr_on_plateau_patience: usize,
    pub feature_names: Vec<String>,
    pub pos_weight_strategy: PosWeightStrategy,
    pub pos_weight: Vec<f64>,
}
