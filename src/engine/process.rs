//! Command-launching engine.
//!
//! Writes the batch as JSON into the data directory and starts the
//! configured command with `{batch}` replaced by that file's path. The
//! command is expected to turn the batch into its own config and expose
//! `local_port` for every item. Children are tracked by pid.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{EngineHandle, ProbeEngine, TestItem};
use crate::config::EngineConfig;
use crate::error::EngineError;

const BATCH_PLACEHOLDER: &str = "{batch}";

struct Running {
    child: Child,
    batch_file: PathBuf,
}

pub struct CommandEngine {
    config: EngineConfig,
    work_dir: PathBuf,
    children: Mutex<HashMap<u32, Running>>,
}

impl CommandEngine {
    pub fn new(config: EngineConfig, work_dir: PathBuf) -> Self {
        Self {
            config,
            work_dir,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn running(&self) -> usize {
        self.children.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ProbeEngine for CommandEngine {
    async fn start_batch(&self, batch: &[TestItem]) -> Result<EngineHandle, EngineError> {
        if batch.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        let program = self.config.command.as_deref().ok_or(EngineError::NotConfigured)?;

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(EngineError::BatchFile)?;
        let batch_file = self
            .work_dir
            .join(format!("speedtest-{}.json", uuid::Uuid::new_v4()));
        let payload = serde_json::to_vec_pretty(batch)?;
        tokio::fs::write(&batch_file, payload)
            .await
            .map_err(EngineError::BatchFile)?;

        let batch_arg = batch_file.to_string_lossy();
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| a.replace(BATCH_PLACEHOLDER, &batch_arg))
            .collect();

        let spawned = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                let _ = tokio::fs::remove_file(&batch_file).await;
                return Err(EngineError::Launch(e));
            }
        };

        // Give the core time to bind its inbound ports.
        tokio::time::sleep(Duration::from_millis(self.config.warmup_ms)).await;

        let exited = match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        };
        let pid = child.id();
        match (exited, pid) {
            (None, Some(pid)) => {
                debug!(pid, program, "Engine process running");
                self.children
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(pid, Running { child, batch_file });
                Ok(EngineHandle(pid))
            }
            (exited, _) => {
                let _ = tokio::fs::remove_file(&batch_file).await;
                Err(EngineError::ExitedEarly(exited.unwrap_or_else(|| "no pid".into())))
            }
        }
    }

    fn stop(&self, handle: EngineHandle) {
        let running = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        let Some(mut running) = running else {
            debug!(pid = %handle, "Stop requested for unknown engine handle");
            return;
        };
        if let Err(e) = running.child.start_kill() {
            warn!(pid = %handle, "Failed to kill engine: {}", e);
        }
        if let Err(e) = std::fs::remove_file(&running.batch_file) {
            debug!(pid = %handle, "Batch file cleanup failed: {}", e);
        }
    }
}
