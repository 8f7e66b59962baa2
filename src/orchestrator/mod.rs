//! Orchestrator: owns the shared state and runs cycles behind the gate.
//!
//! Built once from the config and a set of [`Collaborators`]. Scheduled
//! loops, manual triggers and the binary all go through
//! [`Orchestrator::run_cycle`], which:
//! - waits for the gate (no timeout),
//! - runs the body in its own task so a panic is caught as a `JoinError`,
//! - aborts the body if the optional cycle timeout elapses.
//!
//! The permit and any engine session live inside the body task, so they
//! are released however the body ends. A body that panics or times out
//! skips its own cleanup, so `run_cycle` re-sorts and persists scores
//! and sends the final status in its place.

use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::discovery::{run_harvest, HarvestReport, ProducerRunner};
use crate::engine::ProbeEngine;
use crate::error::{PoolError, Result};
use crate::events::{Notifier, PoolEvent, StatusCallback};
use crate::pool::{
    run_pooling, run_score, sort_by_score, ActiveSelection, PoolContext, PoolingReport, ScoreReport, Scoreboard,
};
use crate::probe::ProbeClient;
use crate::scheduler::{spawn_loops, CycleGate, CycleKind, CycleRunner, SchedulerHandle};
use crate::store::{ScoreRepository, ServerStore};

/// External systems the orchestrator drives.
pub struct Collaborators {
    pub store: Arc<dyn ServerStore>,
    pub engine: Arc<dyn ProbeEngine>,
    pub probe: Arc<dyn ProbeClient>,
    pub runner: Arc<dyn ProducerRunner>,
    pub repository: Arc<ScoreRepository>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cycle", rename_all = "lowercase")]
pub enum CycleReport {
    Harvest(HarvestReport),
    Score(ScoreReport),
    Pooling(PoolingReport),
}

pub struct Orchestrator {
    ctx: PoolContext,
    gate: CycleGate,
    cycle_timeout: Option<Duration>,
}

impl Orchestrator {
    /// Seed the scoreboard from the repository and the active selection
    /// from the store.
    pub fn new(config: PoolConfig, deps: Collaborators) -> Result<Arc<Self>> {
        let scores = deps.repository.load()?;
        let scoreboard = Scoreboard::from_scores(scores);
        let active = ActiveSelection::new(deps.store.active_server());
        info!(
            scores = scoreboard.len(),
            active = ?active.current(),
            "🧭 Orchestrator initialised"
        );

        let cycle_timeout = config.cycle_timeout();
        let ctx = PoolContext {
            config: Arc::new(config),
            store: deps.store,
            engine: deps.engine,
            probe: deps.probe,
            runner: deps.runner,
            repository: deps.repository,
            scoreboard: Arc::new(scoreboard),
            active: Arc::new(active),
            notifier: Notifier::new(),
        };
        Ok(Arc::new(Self {
            ctx,
            gate: CycleGate::new(),
            cycle_timeout,
        }))
    }

    pub fn context(&self) -> &PoolContext {
        &self.ctx
    }

    pub fn scoreboard(&self) -> &Arc<Scoreboard> {
        &self.ctx.scoreboard
    }

    pub fn gate(&self) -> &CycleGate {
        &self.gate
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.ctx.notifier.subscribe()
    }

    pub fn watch_active(&self) -> watch::Receiver<Option<String>> {
        self.ctx.active.subscribe()
    }

    /// Install the status callback and start the three loops.
    pub fn register_and_start(self: &Arc<Self>, status: StatusCallback) -> SchedulerHandle {
        self.ctx.notifier.set_status_callback(status);
        let schedules = CycleKind::ALL.map(|k| (k, self.ctx.config.schedule_for(k)));
        let handle = spawn_loops(Arc::clone(self), schedules);
        info!(loops = handle.kinds().len(), "Scheduler started");
        handle
    }

    /// Register, start and wait on the loops. Only returns once they are
    /// aborted from elsewhere.
    pub async fn run_forever(self: Arc<Self>, status: StatusCallback) {
        self.register_and_start(status).join().await;
    }

    /// Run a cycle now, outside its schedule. Still waits for the gate.
    pub fn trigger_now(self: &Arc<Self>, kind: CycleKind) -> JoinHandle<Result<CycleReport>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_cycle(kind).await })
    }

    pub fn trigger_by_name(self: &Arc<Self>, name: &str) -> Result<JoinHandle<Result<CycleReport>>> {
        let kind: CycleKind = name.parse()?;
        Ok(self.trigger_now(kind))
    }

    pub async fn run_cycle(&self, kind: CycleKind) -> Result<CycleReport> {
        let permit = self.gate.acquire().await?;
        let ctx = self.ctx.clone();
        let mut body = tokio::spawn(async move {
            let _permit = permit;
            match kind {
                CycleKind::Harvest => run_harvest(&ctx).await.map(CycleReport::Harvest),
                CycleKind::Score => run_score(&ctx).await.map(CycleReport::Score),
                CycleKind::Pooling => run_pooling(&ctx).await.map(CycleReport::Pooling),
            }
        });

        let joined = match self.cycle_timeout {
            None => body.await,
            Some(limit) => match tokio::time::timeout(limit, &mut body).await {
                Ok(joined) => joined,
                Err(_) => {
                    body.abort();
                    // Wait for the drop so the permit is back before returning.
                    let _ = body.await;
                    self.finish_interrupted(kind, &format!("aborted after {limit:?}"));
                    return Err(PoolError::CycleTimeout { cycle: kind.name(), timeout: limit });
                }
            },
        };
        match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = join_failure_message(e);
                self.finish_interrupted(kind, &format!("failed: {message}"));
                Err(PoolError::CyclePanicked { cycle: kind.name(), message })
            }
        }
    }

    fn finish_interrupted(&self, kind: CycleKind, outcome: &str) {
        match kind {
            CycleKind::Harvest => {}
            CycleKind::Score => {
                sort_by_score(&self.ctx);
                self.ctx.persist_scores();
            }
            CycleKind::Pooling => self.ctx.persist_scores(),
        }
        self.ctx.notifier.status(true, &format!("Cycle {kind} {outcome}"));
    }

    /// Drop scores for servers deleted outside the engine.
    pub async fn forget_servers(&self, server_ids: &[String]) -> Result<usize> {
        let _permit = self.gate.acquire().await?;
        let removed = self.ctx.scoreboard.remove(server_ids);
        if removed > 0 {
            self.ctx.persist_scores();
        }
        Ok(removed)
    }

    pub fn persist(&self) {
        self.ctx.persist_scores();
    }
}

#[async_trait]
impl CycleRunner for Orchestrator {
    async fn run_scheduled(&self, kind: CycleKind) {
        info!(cycle = %kind, "🔄 Cycle starting");
        match self.run_cycle(kind).await {
            Ok(_) => info!(cycle = %kind, "✅ Cycle complete"),
            Err(e @ PoolError::CyclePanicked { .. }) => error!(cycle = %kind, "{}", e),
            Err(e) => warn!(cycle = %kind, "Cycle failed: {}", e),
        }
    }
}

fn join_failure_message(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        "cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}
