//! # chromatin-ml: chromatin classifier trials
//!
//! This crate runs hyperparameter-search trials for genomic chromatin-state
//! classifiers. A trial picks one of three architectures (DNABERT, GPN,
//! DeepSEA), builds the matching data module and loss weights, trains
//! through an external worker with early stopping and plateau scheduling,
//! checkpoints the result and reports the test metric back to a
//! SQLite-backed study.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;
pub mod runtime;

// Model and data dispatch
pub mod data;
pub mod models;

// Training loop
pub mod training;

// Search
pub mod objective;
pub mod study;

// Re-exports
pub use config::{TrialRunnerConfig, load_config};
pub use error::MlError;
pub use models::{ModelKind, ModelSpec};
pub use objective::ChromatinObjective;
pub use runtime::WorkerRuntime;
pub use study::{Study, StudyDirection, StorageUrl};
