//! Daemon configuration, loaded from `~/.poolwarden/pool.yaml`.
//!
//! Every field has a default, so a missing file or a partial file is
//! fine. `POOLWARDEN_CONFIG` overrides the path.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::{CycleKind, CycleSchedule};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Where scores and engine batch files live.
    pub data_dir: PathBuf,
    pub harvest: HarvestConfig,
    pub speed_test: SpeedTestConfig,
    pub engine: EngineConfig,
    pub schedule: ScheduleConfig,
    /// Hard budget for one cycle body; `None` waits forever.
    pub cycle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HarvestConfig {
    pub script_dir: PathBuf,
    /// File extension a producer must have, without the dot.
    pub extension: String,
    /// Program used to run producers, e.g. `python3`. `None` executes
    /// the file directly.
    pub interpreter: Option<String>,
    pub timeout_secs: u64,
    /// Group assigned to harvested servers.
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpeedTestConfig {
    pub ping_url: String,
    pub ping_timeout_secs: u64,
    pub download_url: String,
    pub download_timeout_secs: u64,
    pub shortlist_size: usize,
    /// First local port the engine forwards; server `i` of a batch gets
    /// `base_port + i`.
    pub base_port: u16,
    pub max_concurrent_probes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub command: Option<String>,
    /// Arguments; `{batch}` is replaced with the batch file path.
    pub args: Vec<String>,
    pub warmup_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub harvest_delay_secs: u64,
    pub harvest_interval_secs: u64,
    pub score_delay_secs: u64,
    pub score_interval_secs: u64,
    pub pooling_delay_secs: u64,
    pub pooling_interval_secs: u64,
}

// ── Defaults ────────────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".poolwarden")
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            harvest: HarvestConfig::default(),
            speed_test: SpeedTestConfig::default(),
            engine: EngineConfig {
                warmup_ms: 1000,
                ..EngineConfig::default()
            },
            schedule: ScheduleConfig::default(),
            cycle_timeout_secs: None,
        }
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            script_dir: default_data_dir().join("scripts"),
            extension: "py".into(),
            interpreter: Some("python3".into()),
            timeout_secs: 300,
            group_id: None,
        }
    }
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            ping_url: "https://www.google.com/generate_204".into(),
            ping_timeout_secs: 10,
            download_url: "https://speed.cloudflare.com/__down?bytes=50000000".into(),
            download_timeout_secs: 10,
            shortlist_size: 10,
            base_port: 39_000,
            max_concurrent_probes: 64,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            harvest_delay_secs: 5,
            harvest_interval_secs: 86_400,
            score_delay_secs: 10,
            score_interval_secs: 3_600,
            pooling_delay_secs: 15,
            pooling_interval_secs: 60,
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────

impl PoolConfig {
    pub fn default_path() -> PathBuf {
        default_data_dir().join("pool.yaml")
    }

    /// Load from `POOLWARDEN_CONFIG` or the default path. A missing file
    /// yields the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("POOLWARDEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path);
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        if config.speed_test.shortlist_size == 0 {
            anyhow::bail!("speedTest.shortlistSize must be at least 1");
        }
        if config.speed_test.max_concurrent_probes == 0 {
            anyhow::bail!("speedTest.maxConcurrentProbes must be at least 1");
        }
        Ok(config)
    }

    pub fn scores_db_path(&self) -> PathBuf {
        self.data_dir.join("scores.db")
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.speed_test.ping_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.speed_test.download_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        self.cycle_timeout_secs.map(Duration::from_secs)
    }

    pub fn schedule_for(&self, kind: CycleKind) -> CycleSchedule {
        let s = &self.schedule;
        let (delay, interval) = match kind {
            CycleKind::Harvest => (s.harvest_delay_secs, s.harvest_interval_secs),
            CycleKind::Score => (s.score_delay_secs, s.score_interval_secs),
            CycleKind::Pooling => (s.pooling_delay_secs, s.pooling_interval_secs),
        };
        CycleSchedule {
            initial_delay: Duration::from_secs(delay),
            interval: Duration::from_secs(interval),
        }
    }
}
