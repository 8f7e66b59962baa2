//! Pooling cycle: throughput-test the best scorers and promote the
//! fastest.
//!
//! Runs one download at a time so the tests do not compete for the
//! same uplink. Promotion happens after the engine is stopped.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::scoreboard::UNTESTED_SPEED;
use super::PoolContext;
use crate::engine::{build_batch, EngineSession, TestItem};
use crate::error::{PoolError, Result};
use crate::probe::local_proxy;
use crate::store::ServerRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolingReport {
    /// Shortlisted ids in test order.
    pub shortlisted: Vec<String>,
    /// Best recorded speed per shortlisted id, MB/s. Untested is -1.
    pub speeds: Vec<(String, f64)>,
    /// Id switched to this cycle, if any.
    pub promoted: Option<String>,
}

/// Run one pooling cycle. The caller holds the gate.
pub async fn run_pooling(ctx: &PoolContext) -> Result<PoolingReport> {
    ctx.notifier.status(false, "Pooling cycle started");

    let candidates = shortlist(ctx);
    if candidates.is_empty() {
        ctx.notifier.status(true, "Pooling skipped: no server with a measured latency");
        return Ok(PoolingReport::default());
    }

    let outcome = measure_all(ctx, &candidates).await;
    ctx.persist_scores();

    let outcome = outcome.and_then(|report| promote_fastest(ctx, report));

    let message = match &outcome {
        Ok(PoolingReport { promoted: Some(id), .. }) => format!("Pooling finished: switched to {id}"),
        Ok(r) => format!("Pooling finished: {} tested, active unchanged", r.shortlisted.len()),
        Err(PoolError::Engine(e)) => format!("Failed to run core: {e}"),
        Err(e) => format!("Pooling failed: {e}"),
    };
    ctx.notifier.status(true, &message);
    outcome
}

/// Ranked candidates that still resolve to a testable store record.
fn shortlist(ctx: &PoolContext) -> Vec<ServerRecord> {
    if ctx.scoreboard.is_empty() {
        return Vec::new();
    }
    let eligible: HashMap<String, ServerRecord> = ctx
        .store
        .eligible_servers(&ServerRecord::is_testable)
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

    ctx.scoreboard
        .shortlist(usize::MAX)
        .into_iter()
        .filter_map(|s| eligible.get(&s.server_id).cloned())
        .take(ctx.config.speed_test.shortlist_size)
        .collect()
}

async fn measure_all(ctx: &PoolContext, candidates: &[ServerRecord]) -> Result<PoolingReport> {
    let batch = build_batch(candidates, ctx.config.speed_test.base_port);
    let session = EngineSession::open(Arc::clone(&ctx.engine), &batch).await?;

    let mut report = PoolingReport {
        shortlisted: batch.iter().map(|i| i.server_id.clone()).collect(),
        ..PoolingReport::default()
    };
    for item in &batch {
        let speed = measure_one(ctx, item).await;
        report.speeds.push((item.server_id.clone(), speed));
    }

    drop(session);
    info!(tested = batch.len(), "🚀 Throughput tests complete");
    Ok(report)
}

/// Returns the speed left on the scoreboard for this server.
async fn measure_one(ctx: &PoolContext, item: &TestItem) -> f64 {
    let id = item.server_id.as_str();
    ctx.scoreboard.reset_speed(id);
    ctx.notifier.speed_result(id, UNTESTED_SPEED);

    let on_progress = |mbps: f64| {
        if ctx.scoreboard.record_speed(id, mbps) {
            ctx.notifier.speed_result(id, mbps);
        }
    };
    let result = ctx
        .probe
        .measure_throughput(
            &ctx.config.speed_test.download_url,
            Some(local_proxy(item.local_port)),
            ctx.config.download_timeout(),
            &on_progress,
        )
        .await;

    match result {
        Ok(mbps) => on_progress(mbps),
        Err(e) => debug!(server_id = %id, "Throughput test failed: {}", e),
    }
    ctx.scoreboard.get(id).map_or(UNTESTED_SPEED, |s| s.speed)
}

fn promote_fastest(ctx: &PoolContext, mut report: PoolingReport) -> Result<PoolingReport> {
    let fastest = report
        .speeds
        .iter()
        .filter(|(_, speed)| *speed > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1));
    let Some((id, speed)) = fastest.cloned() else {
        info!("No server produced a throughput reading");
        return Ok(report);
    };

    let switched = ctx.active.promote(&id, |id| ctx.store.set_active_server(id))?;
    if switched {
        info!(server_id = %id, speed, "⭐ Promoted fastest server to active");
        report.promoted = Some(id);
    } else {
        debug!(server_id = %id, "Fastest server already active");
    }
    Ok(report)
}
