//! Training infrastructure: backends, the trainer loop, callbacks and checkpoints.

pub mod backend;
pub mod callbacks;
pub mod checkpoint;
pub mod experiment;
pub mod metrics;
pub mod reproducibility;
pub mod runner;
pub mod scheduler;

pub use backend::{BackendLauncher, EpochOutcome, TrainingBackend, WorkerBackend, WorkerLauncher};
pub use callbacks::{EarlyStopping, LearningRateMonitor, LoggingInterval, MonitorMode};
pub use checkpoint::{CheckpointManager, checkpoint_path};
pub use experiment::{JsonlRunLogger, RunLogger, TrainingStatus};
pub use metrics::{Predictions, TrainingMetrics, neg_median_auroc};
pub use runner::{Devices, Trainer, TrainerOptions};
pub use scheduler::ReduceLrOnPlateau;
