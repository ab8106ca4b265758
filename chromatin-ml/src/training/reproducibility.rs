//! Reproducibility: environment snapshots and worker seeding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;

/// Environment variable carrying the trial seed into the training worker.
pub const SEED_ENV: &str = "CHROMATIN_SEED";

const TRACKED_ENV_VARS: [&str; 4] = ["PATH", "PYTHONPATH", "CUDA_VISIBLE_DEVICES", "VIRTUAL_ENV"];

/// Snapshot of the training environment for reproducibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub system_info: String,
    pub platform: String,
    pub crate_version: String,
    pub timestamp: DateTime<Utc>,
    /// Hash of the variables that change what the worker sees.
    pub env_vars_hash: String,
}

impl EnvironmentSnapshot {
    pub fn capture() -> Self {
        Self {
            system_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            platform: std::env::consts::OS.to_string(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            env_vars_hash: Self::compute_env_vars_hash(),
        }
    }

    fn compute_env_vars_hash() -> String {
        let mut hasher = Sha256::new();
        for var in TRACKED_ENV_VARS {
            let value = std::env::var(var).unwrap_or_default();
            hasher.update(var.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Export the trial seed to the worker `command` so Python hashing and the
/// worker's own RNGs are pinned to it.
pub fn seed_everything(command: &mut Command, seed: u64) {
    command
        .env("PYTHONHASHSEED", seed.to_string())
        .env(SEED_ENV, seed.to_string());
    tracing::info!(seed, "Global seed set");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_seed_exported_to_worker() {
        let mut command = Command::new("python");
        seed_everything(&mut command, 42);
        let envs: Vec<_> = command.as_std().get_envs().collect();
        assert!(envs.contains(&(OsStr::new("PYTHONHASHSEED"), Some(OsStr::new("42")))));
        assert!(envs.contains(&(OsStr::new(SEED_ENV), Some(OsStr::new("42")))));
    }

    #[test]
    fn test_environment_snapshot() {
        let snapshot = EnvironmentSnapshot::capture();
        assert_eq!(snapshot.env_vars_hash.len(), 64);
        assert!(!snapshot.platform.is_empty());
    }
}
