//! Score cycle: latency-probe every testable server and prune the dead.
//!
//! 1. Batch every testable server and open an engine session for it.
//! 2. Fan out one latency probe per server (bounded concurrency). Each
//!    outcome moves the server's score by ±1 and is emitted right away.
//! 3. Join barrier: nothing below runs until every probe has reported.
//! 4. Prune every server whose score went negative, in one store call.
//! 5. Cleanup, on every path: engine stopped, store re-sorted by score,
//!    scores persisted, final status.

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PoolContext;
use crate::engine::{build_batch, EngineSession, TestItem};
use crate::error::{PoolError, Result};
use crate::events::RefreshKind;
use crate::probe::local_proxy;
use crate::store::{ServerRecord, SortColumn};

/// Slack on top of the probe timeout before a worker is cut off.
const PROBE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreReport {
    pub tested: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Ids removed from the store.
    pub pruned: Vec<String>,
}

/// Run one score cycle. The caller holds the gate.
pub async fn run_score(ctx: &PoolContext) -> Result<ScoreReport> {
    ctx.notifier.status(false, "Score cycle started");

    let outcome = probe_and_prune(ctx).await;

    sort_by_score(ctx);
    ctx.persist_scores();

    let message = match &outcome {
        Ok(r) => format!(
            "Score cycle finished: {} tested, {} ok, {} failed, {} pruned",
            r.tested,
            r.succeeded,
            r.failed,
            r.pruned.len()
        ),
        Err(PoolError::Engine(e)) => format!("Failed to run core: {e}"),
        Err(e) => format!("Score cycle failed: {e}"),
    };
    ctx.notifier.status(true, &message);
    outcome
}

/// Re-sort the store by score, highest first, and ask hosts to refresh.
pub(crate) fn sort_by_score(ctx: &PoolContext) {
    let scores = ctx.scoreboard.snapshot();
    match ctx.store.sort_servers(SortColumn::Score, false, &scores) {
        Ok(()) => ctx.notifier.refresh_needed(RefreshKind::Profiles),
        Err(e) => warn!("Failed to sort servers by score: {}", e),
    }
}

async fn probe_and_prune(ctx: &PoolContext) -> Result<ScoreReport> {
    let servers = ctx.store.eligible_servers(&ServerRecord::is_testable);
    let batch = build_batch(&servers, ctx.config.speed_test.base_port);

    let mut report = ScoreReport::default();
    if batch.is_empty() {
        info!("No testable servers in pool");
    } else {
        let session = EngineSession::open(Arc::clone(&ctx.engine), &batch).await?;
        report = probe_batch(ctx, &batch).await;
        drop(session);
    }

    report.pruned = prune(ctx)?;
    Ok(report)
}

/// Spawned probe workers. Dropping this aborts any still running, so a
/// cancelled cycle leaves no writer behind.
struct ProbeTasks(VecDeque<(String, JoinHandle<bool>)>);

impl Drop for ProbeTasks {
    fn drop(&mut self) {
        for (_, handle) in &self.0 {
            handle.abort();
        }
    }
}

async fn probe_batch(ctx: &PoolContext, batch: &[TestItem]) -> ScoreReport {
    let started = Utc::now();
    let timeout = ctx.config.ping_timeout();
    let url: Arc<str> = Arc::from(ctx.config.speed_test.ping_url.as_str());
    let limiter = Arc::new(Semaphore::new(ctx.config.speed_test.max_concurrent_probes.max(1)));

    let mut tasks = ProbeTasks(VecDeque::with_capacity(batch.len()));
    for item in batch {
        let probe = Arc::clone(&ctx.probe);
        let board = Arc::clone(&ctx.scoreboard);
        let notifier = ctx.notifier.clone();
        let limiter = Arc::clone(&limiter);
        let url = Arc::clone(&url);
        let id = item.server_id.clone();
        let proxy = local_proxy(item.local_port);

        let handle = tokio::spawn(async move {
            let _permit = limiter.acquire_owned().await.ok();
            let measured = tokio::time::timeout(
                timeout + PROBE_GRACE,
                probe.measure_latency(&url, Some(proxy), timeout),
            )
            .await;
            let latency = match measured {
                Ok(Ok(ms)) => Some(ms),
                Ok(Err(e)) => {
                    debug!(server_id = %id, "Latency probe failed: {}", e);
                    None
                }
                Err(_) => {
                    debug!(server_id = %id, "Latency probe overran its timeout");
                    None
                }
            };
            let score = board.record_latency(&id, latency);
            notifier.score_result(&id, score.delay_ms, score.score);
            latency.is_some()
        });
        tasks.0.push_back((item.server_id.clone(), handle));
    }

    let mut report = ScoreReport {
        tested: batch.len(),
        ..ScoreReport::default()
    };
    while let Some((id, handle)) = tasks.0.front_mut() {
        match handle.await {
            Ok(true) => report.succeeded += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                warn!(server_id = %id, "Probe worker died: {}", e);
                if let Some(score) = ctx.scoreboard.record_failure_if_stale(id, started) {
                    ctx.notifier.score_result(id, score.delay_ms, score.score);
                }
                report.failed += 1;
            }
        }
        tasks.0.pop_front();
    }

    info!(
        tested = report.tested,
        succeeded = report.succeeded,
        failed = report.failed,
        "📡 Latency probes complete"
    );
    report
}

/// Remove every server whose score is negative. Runs after the barrier.
fn prune(ctx: &PoolContext) -> Result<Vec<String>> {
    let negative = ctx.scoreboard.negative_ids();
    if negative.is_empty() {
        return Ok(Vec::new());
    }

    let doomed: Vec<ServerRecord> = negative
        .iter()
        .filter_map(|id| ctx.store.get_server(id))
        .collect();
    if !doomed.is_empty() {
        ctx.store.remove_servers(&doomed)?;
    }
    // The store forgets a removed active server; the selection follows.
    for r in &doomed {
        if ctx.active.clear_if(&r.id) {
            info!(server_id = %r.id, "Active server pruned, selection cleared");
        }
    }
    ctx.scoreboard.remove(&negative);

    let pruned: Vec<String> = doomed.into_iter().map(|r| r.id).collect();
    info!(pruned = pruned.len(), "🗑️ Pruned servers with negative score");
    Ok(pruned)
}
