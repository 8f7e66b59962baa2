//! Server store contract: the pool engine's view of the server list.
//!
//! The store owns the records and their persistence. The engine only
//! reads eligible servers, imports harvested lines, removes pruned
//! servers, re-sorts the list and sets the active server through this
//! trait. [`MemoryServerStore`] is the in-process implementation used by
//! the daemon and the tests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::pool::scoreboard::ServerScore;

pub mod memory;
pub mod scores;

pub use memory::MemoryServerStore;
pub use scores::ScoreRepository;

// ── Records ─────────────────────────────────────────────────────────

/// Protocol family of a pooled server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    Vmess,
    Vless,
    Shadowsocks,
    Socks,
    Http,
    Trojan,
    Hysteria2,
    Tuic,
    Wireguard,
    /// Hand-written engine config; never tested automatically.
    Custom,
}

impl ConfigType {
    /// Map a share-link scheme to its config type.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Some(Self::Vmess),
            "vless" => Some(Self::Vless),
            "ss" | "shadowsocks" => Some(Self::Shadowsocks),
            "socks" | "socks5" => Some(Self::Socks),
            "http" | "https" => Some(Self::Http),
            "trojan" => Some(Self::Trojan),
            "hysteria2" | "hy2" => Some(Self::Hysteria2),
            "tuic" => Some(Self::Tuic),
            "wireguard" | "wg" => Some(Self::Wireguard),
            _ => None,
        }
    }
}

/// A pooled candidate server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub config_type: ConfigType,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub enabled: bool,
    /// Whether automatic tests may touch this server.
    pub allow_test: bool,
}

impl ServerRecord {
    /// Servers the score and pooling cycles are allowed to test.
    pub fn is_testable(&self) -> bool {
        self.enabled && self.port > 0 && self.config_type != ConfigType::Custom && self.allow_test
    }
}

/// Column the server list can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    /// Keep insertion order.
    Default,
    ConfigType,
    Remarks,
    Address,
    Port,
    Delay,
    Speed,
    Score,
}

// ── Store Trait ─────────────────────────────────────────────────────

/// Read/write contract against the external server list.
pub trait ServerStore: Send + Sync {
    /// All records matching `predicate`, in store order.
    fn eligible_servers(&self, predicate: &dyn Fn(&ServerRecord) -> bool) -> Vec<ServerRecord>;

    fn get_server(&self, id: &str) -> Option<ServerRecord>;

    /// Import one harvested line. Returns the number of records created;
    /// 0 when the line is invalid or already present.
    fn import_line(&self, line: &str, group_id: Option<&str>, is_sub: bool) -> Result<usize, StoreError>;

    /// Remove a batch of records in one operation.
    fn remove_servers(&self, servers: &[ServerRecord]) -> Result<(), StoreError>;

    fn set_active_server(&self, id: &str) -> Result<(), StoreError>;

    fn active_server(&self) -> Option<String>;

    /// Reorder the list. `scores` supplies the measured columns.
    fn sort_servers(
        &self,
        column: SortColumn,
        ascending: bool,
        scores: &HashMap<String, ServerScore>,
    ) -> Result<(), StoreError>;
}
