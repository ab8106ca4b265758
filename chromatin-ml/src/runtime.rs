//! Training worker process management.
//!
//! Model code and data loaders live in an external Python worker. The
//! runner launches it once per trial and talks to it over stdin/stdout,
//! one JSON object per line in each direction.

use crate::config::WorkerConfig;
use crate::data::{DataModuleSpec, Split};
use crate::error::MlError;
use crate::models::ModelArgs;
use crate::training::reproducibility::seed_everything;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Information about the detected Python installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub venv_path: Option<PathBuf>,
}

/// Trainer settings forwarded to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerArgs {
    pub max_epochs: usize,
    pub devices: serde_json::Value,
    pub precision: u8,
    pub strategy: String,
    pub accumulate_grad_batches: usize,
    pub seed: u64,
}

/// Requests understood by the worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerRequest<'a> {
    Setup {
        model: &'a ModelArgs,
        data: &'a DataModuleSpec,
        trainer: &'a TrainerArgs,
    },
    TrainEpoch {
        epoch: usize,
        lr: f64,
    },
    Predict {
        split: Split,
    },
    SaveCheckpoint {
        path: &'a Path,
    },
    Shutdown,
}

impl WorkerRequest<'_> {
    fn name(&self) -> &'static str {
        match self {
            WorkerRequest::Setup { .. } => "setup",
            WorkerRequest::TrainEpoch { .. } => "train_epoch",
            WorkerRequest::Predict { .. } => "predict",
            WorkerRequest::SaveCheckpoint { .. } => "save_checkpoint",
            WorkerRequest::Shutdown => "shutdown",
        }
    }
}

/// Launches training workers.
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
    script: PathBuf,
    timeout: Duration,
}

impl WorkerRuntime {
    pub fn new(workspace: PathBuf) -> Self {
        Self::with_config(&WorkerConfig::default(), workspace)
    }

    pub fn with_config(config: &WorkerConfig, workspace: PathBuf) -> Self {
        Self {
            python_path: config.python_path.clone(),
            venv_path: config.venv_path.clone(),
            workspace,
            script: config.script.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Detect an available Python installation.
    pub async fn detect() -> Result<PythonInfo, MlError> {
        for cmd in &["python3", "python"] {
            let output = Command::new(cmd).args(["--version"]).output().await;

            if let Ok(output) = output {
                if output.status.success() {
                    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    let version = if version.is_empty() {
                        String::from_utf8_lossy(&output.stderr).trim().to_string()
                    } else {
                        version
                    };

                    return Ok(PythonInfo {
                        path: PathBuf::from(cmd),
                        version,
                        venv_path: detect_venv(),
                    });
                }
            }
        }

        Err(MlError::worker(
            "Python not found. The training worker needs Python 3.8+.",
        ))
    }

    /// Effective interpreter, accounting for a configured venv.
    fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    /// Start the worker script with the trial seed exported.
    pub async fn spawn(&self, seed: u64) -> Result<WorkerProcess, MlError> {
        let script = self.workspace.join(&self.script);
        if !script.is_file() {
            return Err(MlError::worker(format!(
                "worker script not found: {}",
                script.display()
            )));
        }
        let mut command = Command::new(self.python_cmd());
        command.arg(&script).current_dir(&self.workspace);
        seed_everything(&mut command, seed);
        WorkerProcess::spawn(command, self.timeout)
    }
}

/// A running worker with piped stdio.
pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    timeout: Duration,
    /// Set once an exchange broke off; the stream may hold an unread reply.
    poisoned: bool,
}

impl WorkerProcess {
    /// Spawn `command` with stdin/stdout piped; stderr is inherited so worker
    /// progress output stays visible.
    pub fn spawn(mut command: Command, timeout: Duration) -> Result<Self, MlError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MlError::worker(format!("Failed to spawn worker: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MlError::worker("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MlError::worker("worker stdout unavailable"))?;

        debug!(pid = ?child.id(), "Training worker started");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            timeout,
            poisoned: false,
        })
    }

    /// Send one request and wait for its response.
    pub async fn request(
        &mut self,
        request: &WorkerRequest<'_>,
    ) -> Result<serde_json::Value, MlError> {
        let name = request.name();
        if self.poisoned {
            return Err(MlError::worker(format!(
                "worker is out of sync after an interrupted request; refusing '{name}'"
            )));
        }
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let timeout = self.timeout;
        let stdin = &mut self.stdin;
        let stdout = &mut self.stdout;
        let exchange = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
            stdout.next_line().await
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        self.poisoned = !matches!(outcome, Ok(Ok(Some(_))));
        let response = match outcome {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => {
                return Err(MlError::worker(format!(
                    "worker exited while handling '{name}'"
                )));
            }
            Ok(Err(e)) => {
                return Err(MlError::worker(format!("worker pipe error on '{name}': {e}")));
            }
            Err(_) => {
                return Err(MlError::Timeout(format!(
                    "worker request '{name}' timed out after {timeout:?}"
                )));
            }
        };

        let value: serde_json::Value = serde_json::from_str(response.trim()).map_err(|e| {
            self.poisoned = true;
            MlError::worker(format!("invalid JSON from worker on '{name}': {e}"))
        })?;
        if value.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let message = value
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("no error message");
            return Err(MlError::worker(format!("'{name}' failed: {message}")));
        }
        Ok(value)
    }

    /// Whether an earlier request broke off mid-exchange.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Ask the worker to exit and reap it. A poisoned worker is killed
    /// without a shutdown request.
    pub async fn shutdown(mut self) -> Result<(), MlError> {
        let acknowledged = if self.poisoned {
            Err(MlError::worker("worker out of sync"))
        } else {
            self.request(&WorkerRequest::Shutdown).await
        };
        let WorkerProcess {
            mut child, stdin, ..
        } = self;
        // closing stdin ends the worker's read loop
        drop(stdin);
        if let Err(e) = acknowledged {
            warn!(error = %e, "Killing training worker");
            let _ = child.start_kill();
        }
        let status = child.wait().await?;
        debug!(%status, "Training worker exited");
        Ok(())
    }
}

/// Detect a virtual environment in common locations.
fn detect_venv() -> Option<PathBuf> {
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        let path = PathBuf::from(venv);
        if path.exists() {
            return Some(path);
        }
    }

    [".venv", "venv"]
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn shell_worker(script: &str) -> WorkerProcess {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        WorkerProcess::spawn(command, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(WorkerRequest::TrainEpoch { epoch: 3, lr: 1e-3 }).unwrap();
        assert_eq!(json["cmd"], "train_epoch");
        assert_eq!(json["epoch"], 3);
        let json = serde_json::to_value(WorkerRequest::Predict {
            split: Split::Validation,
        })
        .unwrap();
        assert_eq!(json["split"], "validation");
        let json = serde_json::to_value(WorkerRequest::Shutdown).unwrap();
        assert_eq!(json, serde_json::json!({"cmd": "shutdown"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_roundtrip() {
        let mut worker = shell_worker(
            r#"while read line; do echo '{"ok": true, "train_loss": 0.5, "global_step": 4}'; done"#,
        );
        let response = worker
            .request(&WorkerRequest::TrainEpoch { epoch: 0, lr: 5e-5 })
            .await
            .unwrap();
        assert_eq!(response["global_step"], 4);
        worker.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_error_is_reported() {
        let mut worker =
            shell_worker(r#"read line; echo '{"ok": false, "error": "CUDA out of memory"}'"#);
        let err = worker
            .request(&WorkerRequest::Predict { split: Split::Test })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exit_is_reported() {
        let mut worker = shell_worker("read line; exit 0");
        let err = worker
            .request(&WorkerRequest::Predict { split: Split::Test })
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Worker(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_worker_is_not_reused() {
        let mut command = Command::new("sh");
        command.args([
            "-c",
            r#"while read line; do sleep 2; echo '{"ok": true, "train_loss": 0.5, "global_step": 4}'; done"#,
        ]);
        let mut worker = WorkerProcess::spawn(command, Duration::from_millis(300)).unwrap();

        let err = worker
            .request(&WorkerRequest::TrainEpoch { epoch: 0, lr: 5e-5 })
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Timeout(_)));
        assert!(worker.is_poisoned());

        // the late train_epoch reply must never be taken as this answer
        let err = worker
            .request(&WorkerRequest::Predict { split: Split::Test })
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Worker(_)));

        let started = std::time::Instant::now();
        worker.shutdown().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_spawn_missing_script() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = WorkerRuntime::new(dir.path().to_path_buf());
        let err = runtime.spawn(42).await.err().unwrap();
        assert!(err.to_string().contains("train_worker.py"));
    }
}
