//! Producer invocation: run an external harvester, capture its output.
//!
//! No shell is involved: the producer is executed directly, or handed to
//! a configured interpreter as its first argument.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::ProducerError;

/// Captured result of one producer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
}

impl ProducerOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ProducerRunner: Send + Sync {
    async fn invoke(&self, path: &Path) -> Result<ProducerOutput, ProducerError>;
}

pub struct CommandProducerRunner {
    interpreter: Option<String>,
    timeout: Duration,
}

impl CommandProducerRunner {
    pub fn new(interpreter: Option<String>, timeout: Duration) -> Self {
        Self { interpreter, timeout }
    }
}

#[async_trait]
impl ProducerRunner for CommandProducerRunner {
    async fn invoke(&self, path: &Path) -> Result<ProducerOutput, ProducerError> {
        let mut cmd = match &self.interpreter {
            Some(interp) => {
                let mut c = Command::new(interp);
                c.arg(path);
                c
            }
            None => Command::new(path),
        };
        if let Some(dir) = path.parent() {
            cmd.current_dir(dir);
        }
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProducerError::Spawn)?;

        // On timeout the future is dropped and kill_on_drop reaps the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProducerError::Timeout(self.timeout))?
            .map_err(ProducerError::Spawn)?;

        Ok(ProducerOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// All files in `dir` with the given extension, sorted by file name.
pub fn discover_producers(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut producers = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches && path.is_file() {
            producers.push(path);
        }
    }
    producers.sort();
    Ok(producers)
}
