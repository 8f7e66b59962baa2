//! Cycle scheduling and the shared exclusion gate.
//!
//! Every cycle body runs while holding the single [`CycleGate`] permit,
//! so at most one cycle (and therefore at most one engine session) is
//! active at a time. Each cycle kind gets its own loop task:
//!
//! ```text
//! sleep(initial_delay)
//! loop { run cycle to completion; sleep(interval) }
//! ```
//!
//! A loop waits for its cycle to finish before sleeping, so one kind
//! never piles up behind the gate. Failures are handled by the
//! [`CycleRunner`]; the loop itself cannot fail.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::PoolError;

// ── Cycle Kinds ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Harvest,
    Score,
    Pooling,
}

impl CycleKind {
    pub const ALL: [CycleKind; 3] = [CycleKind::Harvest, CycleKind::Score, CycleKind::Pooling];

    pub fn name(self) -> &'static str {
        match self {
            CycleKind::Harvest => "harvest",
            CycleKind::Score => "score",
            CycleKind::Pooling => "pooling",
        }
    }
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CycleKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CycleKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PoolError::UnknownCycle(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSchedule {
    pub initial_delay: Duration,
    pub interval: Duration,
}

// ── Gate ────────────────────────────────────────────────────────────

#[derive(Default)]
struct GateCounters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Capacity-1 gate shared by all cycles. Waiters queue in FIFO order
/// without a timeout.
pub struct CycleGate {
    semaphore: Arc<Semaphore>,
    counters: Arc<GateCounters>,
}

impl Default for CycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleGate {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            counters: Arc::new(GateCounters::default()),
        }
    }

    pub async fn acquire(&self) -> Result<GatePermit, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::GateClosed)?;
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(GatePermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    pub fn acquired(&self) -> u64 {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// No cycle holds the gate.
    pub fn is_idle(&self) -> bool {
        self.semaphore.available_permits() == 1
    }
}

/// Held for the duration of one cycle body. Released on drop, including
/// unwinding and task abort.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Loops ───────────────────────────────────────────────────────────

/// Runs one cycle to completion, handling its outcome.
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    async fn run_scheduled(&self, kind: CycleKind);
}

/// The running loop tasks.
pub struct SchedulerHandle {
    loops: Vec<(CycleKind, JoinHandle<()>)>,
}

impl SchedulerHandle {
    pub fn kinds(&self) -> Vec<CycleKind> {
        self.loops.iter().map(|(k, _)| *k).collect()
    }

    /// Stop all loops. A cycle body already running finishes on its own.
    pub fn abort(&self) {
        for (kind, handle) in &self.loops {
            handle.abort();
            info!(cycle = %kind, "Loop stopped");
        }
    }

    /// Wait for every loop to end (only happens after `abort`).
    pub async fn join(self) {
        for (_, handle) in self.loops {
            let _ = handle.await;
        }
    }
}

pub fn spawn_loops<R: CycleRunner>(
    runner: Arc<R>,
    schedules: impl IntoIterator<Item = (CycleKind, CycleSchedule)>,
) -> SchedulerHandle {
    let loops = schedules
        .into_iter()
        .map(|(kind, schedule)| {
            let runner = Arc::clone(&runner);
            let handle = tokio::spawn(cycle_loop(runner, kind, schedule));
            (kind, handle)
        })
        .collect();
    SchedulerHandle { loops }
}

async fn cycle_loop<R: CycleRunner>(runner: Arc<R>, kind: CycleKind, schedule: CycleSchedule) {
    info!(
        cycle = %kind,
        delay_secs = schedule.initial_delay.as_secs(),
        interval_secs = schedule.interval.as_secs(),
        "⏰ Loop scheduled"
    );
    tokio::time::sleep(schedule.initial_delay).await;
    loop {
        runner.run_scheduled(kind).await;
        tokio::time::sleep(schedule.interval).await;
    }
}
