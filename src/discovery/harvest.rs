//! Harvest cycle: run every producer and import what it emits.
//!
//! Producers are independent: one that fails to start, times out, exits
//! non-zero or writes to stderr is reported and the next one still runs.
//! Stdout is parsed whenever it is non-empty, whatever the exit status.

use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use super::parser::extract_import_lines;
use super::producer::{discover_producers, ProducerOutput};
use crate::error::Result;
use crate::events::RefreshKind;
use crate::pool::PoolContext;

/// Outcome for one producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerReport {
    pub name: String,
    /// Non-blank lines found in the data block, after base64 expansion.
    pub total_lines: usize,
    /// Records created in the store.
    pub imported: usize,
    /// Set when the producer could not be run or misbehaved.
    pub failed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestReport {
    pub producers: Vec<ProducerReport>,
}

impl HarvestReport {
    pub fn total_lines(&self) -> usize {
        self.producers.iter().map(|p| p.total_lines).sum()
    }

    pub fn imported(&self) -> usize {
        self.producers.iter().map(|p| p.imported).sum()
    }
}

/// Run one harvest cycle. The caller holds the gate.
pub async fn run_harvest(ctx: &PoolContext) -> Result<HarvestReport> {
    ctx.notifier.status(false, "Harvest started");
    let cfg = &ctx.config.harvest;

    let producers = match discover_producers(&cfg.script_dir, &cfg.extension) {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %cfg.script_dir.display(), "Script directory does not exist");
            Vec::new()
        }
        Err(e) => {
            ctx.notifier.status(true, &format!("Harvest failed: {e}"));
            return Err(e.into());
        }
    };
    info!(count = producers.len(), "🌾 Harvesting from producers");

    let mut report = HarvestReport::default();
    for path in &producers {
        let producer = harvest_one(ctx, path).await;
        ctx.notifier.status(
            false,
            &format!(
                "Producer {}: total {}, imported {}",
                producer.name, producer.total_lines, producer.imported
            ),
        );
        report.producers.push(producer);
    }

    ctx.notifier.refresh_needed(RefreshKind::Subscriptions);
    info!(
        producers = report.producers.len(),
        lines = report.total_lines(),
        imported = report.imported(),
        "Harvest complete"
    );
    ctx.notifier
        .status(true, &format!("Harvest finished ({} producers)", report.producers.len()));
    Ok(report)
}

async fn harvest_one(ctx: &PoolContext, path: &Path) -> ProducerReport {
    let mut report = ProducerReport {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
        ..ProducerReport::default()
    };

    let output = match ctx.runner.invoke(path).await {
        Ok(o) => o,
        Err(e) => {
            report_failure(ctx, &mut report, e.to_string());
            return report;
        }
    };
    check_output(ctx, &mut report, &output);
    if output.stdout.trim().is_empty() {
        return report;
    }

    let group = ctx.config.harvest.group_id.as_deref();
    for line in extract_import_lines(&output.stdout) {
        report.total_lines += 1;
        match ctx.store.import_line(&line, group, true) {
            Ok(n) => report.imported += n,
            Err(e) => debug!(producer = %report.name, "Import rejected: {}", e),
        }
    }
    report
}

fn check_output(ctx: &PoolContext, report: &mut ProducerReport, output: &ProducerOutput) {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        report_failure(ctx, report, format!("stderr: {stderr}"));
    }
    if !output.succeeded() {
        let code = output
            .exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        report_failure(ctx, report, format!("exit status {code}"));
    }
    if output.stdout.trim().is_empty() {
        report_failure(ctx, report, "no output".to_string());
    }
}

fn report_failure(ctx: &PoolContext, report: &mut ProducerReport, reason: String) {
    warn!(producer = %report.name, "Producer problem: {}", reason);
    ctx.notifier
        .status(false, &format!("Producer {} failed: {}", report.name, reason));
    report.failed = Some(reason);
}
