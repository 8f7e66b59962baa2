//! Pool cycles: latency scoring and throughput-based selection.
//!
//! Both cycles work on the same [`PoolContext`]: the collaborators
//! (store, engine, probe client), the shared scoreboard and the active
//! selection. Callers must hold the orchestrator's gate while a cycle
//! runs; the cycles themselves do not lock anything beyond the
//! scoreboard's per-update lock.

use std::sync::Arc;
use tracing::warn;

use crate::config::PoolConfig;
use crate::discovery::ProducerRunner;
use crate::engine::ProbeEngine;
use crate::events::Notifier;
use crate::probe::ProbeClient;
use crate::store::{ScoreRepository, ServerStore};

pub mod pooling;
pub mod score;
pub mod scoreboard;

pub use pooling::{run_pooling, PoolingReport};
pub use score::{run_score, ScoreReport};
pub(crate) use score::sort_by_score;
pub use scoreboard::{ActiveSelection, Scoreboard, ServerScore};

/// Everything a cycle body needs. Cheap to clone.
#[derive(Clone)]
pub struct PoolContext {
    pub config: Arc<PoolConfig>,
    pub store: Arc<dyn ServerStore>,
    pub engine: Arc<dyn ProbeEngine>,
    pub probe: Arc<dyn ProbeClient>,
    pub runner: Arc<dyn ProducerRunner>,
    pub repository: Arc<ScoreRepository>,
    pub scoreboard: Arc<Scoreboard>,
    pub active: Arc<ActiveSelection>,
    pub notifier: Notifier,
}

impl PoolContext {
    /// Write the scoreboard to the repository. Failures are logged only.
    pub fn persist_scores(&self) {
        if let Err(e) = self.repository.save(&self.scoreboard.snapshot()) {
            warn!("Failed to persist scores: {}", e);
        }
    }
}
