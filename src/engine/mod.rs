//! Probing engine lifecycle.
//!
//! The engine is the external proxy core that exposes one local HTTP
//! proxy port per server of a test batch. It is used one batch at a
//! time: a cycle opens an [`EngineSession`] for its batch and the
//! session stops the engine when dropped, on every exit path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::store::{ConfigType, ServerRecord};

pub mod process;

pub use process::CommandEngine;

/// One server of a test batch, with the local port the engine forwards
/// to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestItem {
    pub server_id: String,
    pub address: String,
    pub port: u16,
    pub config_type: ConfigType,
    pub allow_test: bool,
    pub local_port: u16,
}

/// Engine process handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u32);

impl std::fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait ProbeEngine: Send + Sync {
    /// Launch an engine instance serving exactly `batch`.
    async fn start_batch(&self, batch: &[TestItem]) -> Result<EngineHandle, EngineError>;

    /// Stop the instance. Unknown handles are ignored.
    fn stop(&self, handle: EngineHandle);
}

/// Build a test batch, assigning consecutive local ports from
/// `base_port`. Servers that would overflow the port range are left out.
pub fn build_batch(servers: &[ServerRecord], base_port: u16) -> Vec<TestItem> {
    let mut batch = Vec::with_capacity(servers.len());
    for (i, server) in servers.iter().enumerate() {
        let Some(local_port) = u16::try_from(i).ok().and_then(|i| base_port.checked_add(i)) else {
            warn!(dropped = servers.len() - i, "Local port range exhausted, batch truncated");
            break;
        };
        batch.push(TestItem {
            server_id: server.id.clone(),
            address: server.address.clone(),
            port: server.port,
            config_type: server.config_type,
            allow_test: server.allow_test,
            local_port,
        });
    }
    batch
}

// ── Session Guard ───────────────────────────────────────────────────

/// An open engine instance. Dropping it stops the engine.
pub struct EngineSession {
    engine: Arc<dyn ProbeEngine>,
    handle: EngineHandle,
}

impl EngineSession {
    pub async fn open(engine: Arc<dyn ProbeEngine>, batch: &[TestItem]) -> Result<Self, EngineError> {
        let handle = engine.start_batch(batch).await?;
        info!(pid = %handle, servers = batch.len(), "⚙️ Engine started for test batch");
        Ok(Self { engine, handle })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.engine.stop(self.handle);
        info!(pid = %self.handle, "Engine stopped");
    }
}
