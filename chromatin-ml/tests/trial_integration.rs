//! End-to-end trial tests.
//!
//! These run the full study -> objective -> trainer path against an
//! in-process backend, checking checkpoints, run logs, SQLite persistence
//! and the TSV export.

use async_trait::async_trait;
use chromatin_ml::config::TrialRunnerConfig;
use chromatin_ml::data::{DataModuleSpec, Split};
use chromatin_ml::models::ModelArgs;
use chromatin_ml::runtime::TrainerArgs;
use chromatin_ml::study::{ParamDistribution, TrialState};
use chromatin_ml::training::{BackendLauncher, EpochOutcome, Predictions, TrainingBackend};
use chromatin_ml::{ChromatinObjective, MlError, StorageUrl, Study, StudyDirection};
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const STEPS_PER_EPOCH: u64 = 10;

#[derive(Default)]
struct BackendLog {
    model: Option<ModelArgs>,
    trainer: Option<TrainerArgs>,
    lrs: Vec<f64>,
    checkpoints: Vec<PathBuf>,
    shutdowns: usize,
}

/// Backend whose validation AUROC peaks on the first epoch.
struct FakeBackend {
    log: Arc<Mutex<BackendLog>>,
    epoch: usize,
    degenerate_test: bool,
}

fn labels() -> Vec<Vec<u8>> {
    vec![vec![1, 1], vec![1, 0], vec![0, 1], vec![0, 0]]
}

fn perfect() -> Predictions {
    Predictions {
        loss: Some(0.1),
        probs: vec![
            vec![0.9, 0.9],
            vec![0.8, 0.1],
            vec![0.2, 0.8],
            vec![0.1, 0.2],
        ],
        labels: labels(),
    }
}

fn degraded() -> Predictions {
    Predictions {
        loss: Some(0.4),
        probs: vec![
            vec![0.9, 0.9],
            vec![0.2, 0.1],
            vec![0.8, 0.2],
            vec![0.1, 0.8],
        ],
        labels: labels(),
    }
}

#[async_trait]
impl TrainingBackend for FakeBackend {
    async fn setup(
        &mut self,
        model: &ModelArgs,
        _data: &DataModuleSpec,
        trainer: &TrainerArgs,
    ) -> Result<(), MlError> {
        let mut log = self.log.lock().unwrap();
        log.model = Some(model.clone());
        log.trainer = Some(trainer.clone());
        Ok(())
    }

    async fn train_epoch(&mut self, epoch: usize, lr: f64) -> Result<EpochOutcome, MlError> {
        self.epoch = epoch;
        self.log.lock().unwrap().lrs.push(lr);
        Ok(EpochOutcome {
            train_loss: 1.0 / (epoch as f64 + 1.0),
            global_step: (epoch as u64 + 1) * STEPS_PER_EPOCH,
        })
    }

    async fn predict(&mut self, split: Split) -> Result<Predictions, MlError> {
        match split {
            Split::Validation if self.epoch == 0 => Ok(perfect()),
            Split::Validation => Ok(degraded()),
            Split::Test if self.degenerate_test => Ok(Predictions {
                loss: None,
                probs: vec![vec![0.5, 0.5]; 4],
                labels: vec![vec![0, 0]; 4],
            }),
            _ => Ok(perfect()),
        }
    }

    async fn save_checkpoint(&mut self, path: &Path) -> Result<(), MlError> {
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(path, b"weights")?;
        self.log.lock().unwrap().checkpoints.push(path.to_path_buf());
        Ok(())
    }

    async fn shutdown(self: Box<Self>) -> Result<(), MlError> {
        self.log.lock().unwrap().shutdowns += 1;
        Ok(())
    }
}

struct FakeLauncher {
    log: Arc<Mutex<BackendLog>>,
    degenerate_test: bool,
}

#[async_trait]
impl BackendLauncher for FakeLauncher {
    async fn launch(&self, _seed: u64) -> Result<Box<dyn TrainingBackend>, MlError> {
        Ok(Box::new(FakeBackend {
            log: self.log.clone(),
            epoch: 0,
            degenerate_test: self.degenerate_test,
        }))
    }
}

/// Workspace with train/validation/test label tables under `data/`.
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    let table = "chrom\tstart\tend\tstrand\tDNase_leaf\tH3K4me3_root\n\
                 Chr1\t0\t512\t+\t1\t0\n\
                 Chr1\t512\t1024\t+\t0\t0\n\
                 Chr2\t0\t512\t-\t0\t1\n\
                 Chr2\t512\t1024\t-\t0\t1\n";
    for split in ["train", "validation", "test"] {
        std::fs::write(data.join(format!("{split}.tsv")), table).unwrap();
    }
    dir
}

fn config(workspace: &Path) -> TrialRunnerConfig {
    let mut config = TrialRunnerConfig::default();
    config.trial.data_path = PathBuf::from("data");
    config.trial.n_output = 2;
    config.study.storage = "sqlite:///study.sqlite3".to_string();
    config.study.search_space.insert(
        "pos_weight_strategy".to_string(),
        ParamDistribution::Choice {
            values: vec![serde_json::json!("ones"), serde_json::json!("eights")],
        },
    );
    config.logger.save_dir = workspace.join("lightning_logs");
    config
}

fn open_study(workspace: &Path, config: &TrialRunnerConfig) -> Study {
    let url = StorageUrl::parse(&config.study.storage, workspace).unwrap();
    Study::create(&config.study.name, &url, StudyDirection::Minimize, true)
        .unwrap()
        .with_sampler_seed(42)
}

#[tokio::test]
async fn test_trial_trains_checkpoints_and_records() {
    let ws = workspace();
    let config = config(ws.path());
    let log = Arc::new(Mutex::new(BackendLog::default()));
    let mut objective = ChromatinObjective::new(
        config.clone(),
        Box::new(FakeLauncher {
            log: log.clone(),
            degenerate_test: false,
        }),
        ws.path().to_path_buf(),
    );
    let mut study = open_study(ws.path(), &config);
    study.optimize(&mut objective, 1).await.unwrap();

    // GPN preset: plateau patience 0, so early stopping waits two epochs.
    let log = log.lock().unwrap();
    assert_eq!(log.lrs.len(), 3);
    assert_eq!(log.lrs[0], 5e-5);
    assert_eq!(log.lrs[1], 5e-5);
    assert!((log.lrs[2] - 5e-6).abs() < 1e-12);
    assert_eq!(log.shutdowns, 1);

    let expected = ws
        .path()
        .join("lightning_logs")
        .join("version_0")
        .join("epoch_3-step_30.ckpt");
    assert_eq!(log.checkpoints, vec![expected.clone()]);

    let model = log.model.as_ref().unwrap();
    assert_eq!(model.feature_names, vec!["DNase_leaf", "H3K4me3_root"]);
    assert_eq!(model.batch_size, 128);
    let trainer = log.trainer.as_ref().unwrap();
    assert_eq!(trainer.accumulate_grad_batches, 2);
    assert_eq!(trainer.seed, 42);

    let best = study.best_trial().unwrap();
    assert_eq!(best.state, TrialState::Complete);
    assert_eq!(best.value, Some(-1.0));
    assert_eq!(
        best.user_attrs["checkpoint_path"],
        serde_json::json!(expected.display().to_string())
    );
    assert_eq!(best.user_attrs["module"], serde_json::json!("GPN"));
    assert_eq!(best.user_attrs["epochs"], serde_json::json!(3));
    assert_eq!(best.user_attrs["global_step"], serde_json::json!(30));

    let strategy = best.params["pos_weight_strategy"].as_str().unwrap();
    let weight = if strategy == "ones" { 1.0 } else { 8.0 };
    assert_eq!(model.pos_weight, vec![weight, weight]);

    let run: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(ws.path().join("lightning_logs/version_0/run.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(run["status"], "completed");
    let metrics = std::fs::read_to_string(ws.path().join("lightning_logs/version_0/metrics.jsonl"))
        .unwrap();
    assert!(metrics.contains("\"lr-AdamW\""));
    assert!(metrics.contains("\"test/neg_median_auroc\":-1.0"));
}

#[tokio::test]
async fn test_study_persists_and_exports() {
    let ws = workspace();
    let config = config(ws.path());
    let log = Arc::new(Mutex::new(BackendLog::default()));
    {
        let mut objective = ChromatinObjective::new(
            config.clone(),
            Box::new(FakeLauncher {
                log: log.clone(),
                degenerate_test: false,
            }),
            ws.path().to_path_buf(),
        );
        let mut study = open_study(ws.path(), &config);
        study.optimize(&mut objective, 2).await.unwrap();
    }

    // Reopening the same storage sees both trials.
    let study = open_study(ws.path(), &config);
    let trials = study.trials().unwrap();
    assert_eq!(trials.len(), 2);
    assert_eq!(trials[1].user_attrs["run_version"], serde_json::json!("1"));

    let export = ws.path().join("trials_dataframe.tsv");
    study.trials_dataframe().unwrap().export_tsv(&export).unwrap();
    let text = std::fs::read_to_string(&export).unwrap();
    let mut lines = text.lines();
    let header: Vec<&str> = lines.next().unwrap().split('\t').collect();
    assert_eq!(header[0], "");
    assert!(header.contains(&"params_pos_weight_strategy"));
    assert!(header.contains(&"user_attrs_checkpoint_path"));
    assert_eq!(header.last(), Some(&"state"));
    assert_eq!(lines.filter(|l| l.ends_with("\tCOMPLETE")).count(), 2);
}

#[tokio::test]
async fn test_failed_evaluation_marks_trial_and_run() {
    let ws = workspace();
    let config = config(ws.path());
    let log = Arc::new(Mutex::new(BackendLog::default()));
    let mut objective = ChromatinObjective::new(
        config.clone(),
        Box::new(FakeLauncher {
            log: log.clone(),
            degenerate_test: true,
        }),
        ws.path().to_path_buf(),
    );
    let mut study = open_study(ws.path(), &config);
    let err = study.optimize(&mut objective, 1).await.unwrap_err();
    assert!(matches!(err, MlError::Evaluation(_)));

    let trials = study.trials().unwrap();
    assert_eq!(trials[0].state, TrialState::Fail);
    assert!(matches!(study.best_params(), Err(MlError::NotFound(_))));
    assert_eq!(log.lock().unwrap().shutdowns, 1);

    let run: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(ws.path().join("lightning_logs/version_0/run.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(run["status"], "failed");
}

#[tokio::test]
async fn test_missing_split_fails_before_launch() {
    let ws = workspace();
    std::fs::remove_file(ws.path().join("data/test.tsv")).unwrap();
    let config = config(ws.path());
    let log = Arc::new(Mutex::new(BackendLog::default()));
    let mut objective = ChromatinObjective::new(
        config.clone(),
        Box::new(FakeLauncher {
            log: log.clone(),
            degenerate_test: false,
        }),
        ws.path().to_path_buf(),
    );
    let mut study = open_study(ws.path(), &config);
    let err = study.optimize(&mut objective, 1).await.unwrap_err();
    assert!(matches!(err, MlError::Dataset(_)));
    assert!(log.lock().unwrap().model.is_none());
    assert_eq!(study.trials().unwrap()[0].state, TrialState::Fail);
}
