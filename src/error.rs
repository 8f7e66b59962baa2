//! Error taxonomy for the pool engine.
//!
//! Errors stay inside the cycle that raised them. The scheduler only
//! ever logs a `PoolError`; nothing here crosses back into the caller of
//! `Orchestrator::register_and_start`.

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = PoolError> = std::result::Result<T, E>;

/// Raised by a [`crate::store::ServerStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("server '{0}' not found")]
    NotFound(String),
}

/// Raised while starting or stopping the probing engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("empty test batch")]
    EmptyBatch,
    #[error("no engine command configured")]
    NotConfigured,
    #[error("failed to launch engine: {0}")]
    Launch(#[source] std::io::Error),
    #[error("engine exited during warmup ({0})")]
    ExitedEarly(String),
    #[error("failed to write batch file: {0}")]
    BatchFile(#[source] std::io::Error),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Raised by a single latency or throughput measurement. Absorbed per
/// server by the cycle that made it.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid proxy address: {0}")]
    Proxy(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
}

/// Raised while invoking one harvest producer. Recorded in that
/// producer's report.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to spawn producer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("producer timed out after {0:?}")]
    Timeout(Duration),
}

/// Top-level error surfaced at a cycle boundary.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("score persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cycle gate closed")]
    GateClosed,
    #[error("unknown cycle '{0}'")]
    UnknownCycle(String),
    #[error("cycle '{cycle}' exceeded its {timeout:?} budget")]
    CycleTimeout { cycle: &'static str, timeout: Duration },
    #[error("cycle '{cycle}' panicked: {message}")]
    CyclePanicked { cycle: &'static str, message: String },
}
