//! Poolwarden daemon: keeps a proxy pool scored and the fastest server
//! active.
//!
//! Usage:
//!   poolwarden                 run the scheduled loops until Ctrl-C
//!   poolwarden --once <cycle>  run one cycle (harvest | score | pooling) and exit
//!
//! Environment:
//!   POOLWARDEN_CONFIG    config file (default ~/.poolwarden/pool.yaml)
//!   POOLWARDEN_LOG_JSON  set to 1 for JSON log lines
//!   RUST_LOG             log filter (default poolwarden=info)

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use poolwarden::config::PoolConfig;
use poolwarden::discovery::CommandProducerRunner;
use poolwarden::engine::CommandEngine;
use poolwarden::events::PoolEvent;
use poolwarden::probe::HttpProbeClient;
use poolwarden::store::{MemoryServerStore, ScoreRepository};
use poolwarden::{Collaborators, CycleKind, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("🛰️ Poolwarden v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let once = parse_once()?;
    let config = PoolConfig::load().context("Failed to load configuration")?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    // ── Score Repository ────────────────────────────────────────────
    let repository = Arc::new(
        ScoreRepository::open(&config.scores_db_path()).context("Failed to open score database")?,
    );

    // ── Collaborators ───────────────────────────────────────────────
    if config.engine.command.is_none() {
        warn!("No engine command configured; score and pooling cycles will fail to start the core");
    }
    let runner = CommandProducerRunner::new(
        config.harvest.interpreter.clone(),
        std::time::Duration::from_secs(config.harvest.timeout_secs),
    );
    let deps = Collaborators {
        store: Arc::new(MemoryServerStore::new()),
        engine: Arc::new(CommandEngine::new(config.engine.clone(), config.data_dir.clone())),
        probe: Arc::new(HttpProbeClient::new()),
        runner: Arc::new(runner),
        repository,
    };

    info!(
        data_dir = %config.data_dir.display(),
        scripts = %config.harvest.script_dir.display(),
        "📦 Data directory ready"
    );
    let orchestrator = Orchestrator::new(config, deps).context("Failed to initialise orchestrator")?;

    if let Some(kind) = once {
        let report = orchestrator.run_cycle(kind).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    spawn_watchers(&orchestrator);

    let handle = orchestrator.register_and_start(Arc::new(|is_final, msg: &str| {
        if is_final {
            debug!(target: "poolwarden::status", "■ {}", msg);
        }
    }));

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("Poolwarden ready, loops scheduled");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    handle.abort();
    orchestrator.persist();
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "poolwarden=info".into());
    let json = std::env::var("POOLWARDEN_LOG_JSON").is_ok_and(|v| v == "1");
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn parse_once() -> Result<Option<CycleKind>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--once") => {
            let name = args.next().context("--once needs a cycle name")?;
            Ok(Some(name.parse()?))
        }
        Some(other) => anyhow::bail!("Unknown argument '{other}'"),
    }
}

/// Log per-server results and active-server changes.
fn spawn_watchers(orchestrator: &Arc<Orchestrator>) {
    let mut events = orchestrator.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PoolEvent::ScoreResult { server_id, delay_ms, score }) => {
                    info!(server_id = %server_id, delay_ms, score, "Latency result");
                }
                Ok(PoolEvent::SpeedResult { server_id, speed }) => {
                    info!(server_id = %server_id, speed, "Speed result");
                }
                Ok(PoolEvent::RefreshNeeded { kind }) => info!(?kind, "Refresh needed"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut active = orchestrator.watch_active();
    tokio::spawn(async move {
        while active.changed().await.is_ok() {
            let current = active.borrow_and_update().clone();
            match current {
                Some(id) => info!(server_id = %id, "⭐ Active server changed"),
                None => info!("Active server cleared"),
            }
        }
    });
}
