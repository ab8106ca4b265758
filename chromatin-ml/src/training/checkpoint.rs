//! Checkpoint naming and bookkeeping.
//!
//! The worker owns the checkpoint format; this module decides where a
//! checkpoint goes and keeps a manifest of what was written.

use crate::error::MlError;
use crate::persistence::{atomic_write_json, load_json};
use crate::training::callbacks::MonitorMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "checkpoints.json";

/// Path of the checkpoint for a run at a given point of training:
/// `<save_dir>/version_<v>/epoch_<e>-step_<s>.ckpt`.
pub fn checkpoint_path(save_dir: &Path, version: &str, epoch: usize, global_step: u64) -> PathBuf {
    save_dir
        .join(format!("version_{version}"))
        .join(format!("epoch_{epoch}-step_{global_step}.ckpt"))
}

/// A recorded checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_version: String,
    pub epoch: usize,
    pub global_step: u64,
    pub monitor_value: Option<f64>,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Keeps a manifest of checkpoints per run directory.
pub struct CheckpointManager {
    run_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(run_dir: PathBuf, max_checkpoints: usize) -> Self {
        Self {
            run_dir,
            max_checkpoints,
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.run_dir.join(MANIFEST_FILE)
    }

    /// List recorded checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>, MlError> {
        Ok(load_json(&self.manifest_path())?.unwrap_or_default())
    }

    /// Best checkpoint by monitored value.
    pub fn best(&self, mode: MonitorMode) -> Result<Option<Checkpoint>, MlError> {
        let checkpoints = self.list()?;
        Ok(checkpoints
            .into_iter()
            .filter(|c| c.monitor_value.is_some_and(f64::is_finite))
            .reduce(|best, c| {
                match (c.monitor_value, best.monitor_value) {
                    (Some(v), Some(b)) if mode.is_better(v, b, 0.0) => c,
                    _ => best,
                }
            }))
    }

    /// Record a checkpoint the worker has written to `path`.
    pub fn record(
        &self,
        run_version: &str,
        epoch: usize,
        global_step: u64,
        monitor_value: Option<f64>,
        path: &Path,
    ) -> Result<Checkpoint, MlError> {
        let (hash, size_bytes) = if path.is_file() {
            (hash_file(path)?, std::fs::metadata(path)?.len())
        } else {
            tracing::warn!(path = %path.display(), "Checkpoint file missing, hashing metadata only");
            let mut hasher = Sha256::new();
            hasher.update(run_version.as_bytes());
            hasher.update(epoch.to_le_bytes());
            hasher.update(global_step.to_le_bytes());
            (format!("{:x}", hasher.finalize()), 0)
        };

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            run_version: run_version.to_string(),
            epoch,
            global_step,
            monitor_value,
            path: path.to_path_buf(),
            hash,
            size_bytes,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.push(checkpoint.clone());
        while checkpoints.len() > self.max_checkpoints {
            checkpoints.remove(0);
        }
        atomic_write_json(&self.manifest_path(), &checkpoints)?;

        tracing::info!(
            path = %checkpoint.path.display(),
            epoch,
            global_step,
            size_bytes,
            "Checkpoint recorded"
        );
        Ok(checkpoint)
    }
}

fn hash_file(path: &Path) -> Result<String, MlError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
