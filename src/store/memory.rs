//! In-process server store.
//!
//! Holds records in insertion order behind an `RwLock`. Imported lines
//! are deduplicated against the lines of the records currently held, so
//! a pruned server can come back on the next harvest. Only the address,
//! port and remarks of a share link are extracted; the full protocol
//! payload is kept opaque.

use base64::{engine::general_purpose, Engine as _};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

use super::{ConfigType, ServerRecord, ServerStore, SortColumn};
use crate::error::StoreError;
use crate::pool::scoreboard::ServerScore;

struct Entry {
    record: ServerRecord,
    source_line: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    active: Option<String>,
}

#[derive(Default)]
pub struct MemoryServerStore {
    inner: RwLock<Inner>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly (user import, tests).
    pub fn insert(&self, record: ServerRecord) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.push(Entry { record, source_line: None });
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record ids in current store order.
    pub fn ids(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.iter().map(|e| e.record.id.clone()).collect()
    }
}

impl ServerStore for MemoryServerStore {
    fn eligible_servers(&self, predicate: &dyn Fn(&ServerRecord) -> bool) -> Vec<ServerRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .iter()
            .filter(|e| predicate(&e.record))
            .map(|e| e.record.clone())
            .collect()
    }

    fn get_server(&self, id: &str) -> Option<ServerRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.iter().find(|e| e.record.id == id).map(|e| e.record.clone())
    }

    fn import_line(&self, line: &str, group_id: Option<&str>, _is_sub: bool) -> Result<usize, StoreError> {
        let line = line.trim();
        let Some(parsed) = parse_share_line(line) else {
            debug!(line = %truncate(line, 80), "Unrecognised import line");
            return Ok(0);
        };

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.iter().any(|e| e.source_line.as_deref() == Some(line)) {
            return Ok(0);
        }

        let record = ServerRecord {
            id: uuid::Uuid::new_v4().to_string(),
            address: parsed.address,
            port: parsed.port,
            config_type: parsed.config_type,
            remarks: parsed.remarks,
            group_id: group_id.map(str::to_string),
            enabled: true,
            allow_test: true,
        };
        debug!(server_id = %record.id, address = %record.address, port = record.port, "Server imported");
        inner.entries.push(Entry { record, source_line: Some(line.to_string()) });
        Ok(1)
    }

    fn remove_servers(&self, servers: &[ServerRecord]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.entries.len();
        inner.entries.retain(|e| !servers.iter().any(|s| s.id == e.record.id));
        let removed = before - inner.entries.len();

        if let Some(active) = inner.active.clone() {
            if servers.iter().any(|s| s.id == active) {
                inner.active = None;
            }
        }
        info!(removed, "Servers removed from store");
        Ok(())
    }

    fn set_active_server(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.entries.iter().any(|e| e.record.id == id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner.active = Some(id.to_string());
        Ok(())
    }

    fn active_server(&self) -> Option<String> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).active.clone()
    }

    fn sort_servers(
        &self,
        column: SortColumn,
        ascending: bool,
        scores: &HashMap<String, ServerScore>,
    ) -> Result<(), StoreError> {
        if column == SortColumn::Default {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.sort_by(|a, b| {
            let ord = compare(column, &a.record, &b.record, scores);
            if ascending { ord } else { ord.reverse() }
        });
        Ok(())
    }
}

fn compare(
    column: SortColumn,
    a: &ServerRecord,
    b: &ServerRecord,
    scores: &HashMap<String, ServerScore>,
) -> Ordering {
    let score_of = |r: &ServerRecord| scores.get(&r.id);
    match column {
        SortColumn::Default => Ordering::Equal,
        SortColumn::ConfigType => a.config_type.cmp(&b.config_type),
        SortColumn::Remarks => a.remarks.cmp(&b.remarks),
        SortColumn::Address => a.address.cmp(&b.address),
        SortColumn::Port => a.port.cmp(&b.port),
        SortColumn::Delay => {
            let d = |r: &ServerRecord| score_of(r).map_or(-1, |s: &ServerScore| s.delay_ms);
            d(a).cmp(&d(b))
        }
        SortColumn::Speed => {
            let s = |r: &ServerRecord| score_of(r).map_or(-1.0, |s: &ServerScore| s.speed);
            s(a).total_cmp(&s(b))
        }
        SortColumn::Score => {
            let s = |r: &ServerRecord| score_of(r).map_or(0, |s: &ServerScore| s.score);
            s(a).cmp(&s(b))
        }
    }
}

// ── Share Line Extraction ───────────────────────────────────────────

struct ParsedLine {
    config_type: ConfigType,
    address: String,
    port: u16,
    remarks: String,
}

/// Pull the endpoint out of `scheme://[userinfo@]host:port[/path][?query][#remarks]`.
/// `vmess://` carries a base64 JSON object instead.
fn parse_share_line(line: &str) -> Option<ParsedLine> {
    let (scheme, rest) = line.split_once("://")?;
    let config_type = ConfigType::from_scheme(scheme)?;

    if config_type == ConfigType::Vmess {
        return parse_vmess(rest);
    }

    let (body, remarks) = match rest.split_once('#') {
        Some((b, r)) => (b, r.to_string()),
        None => (rest, String::new()),
    };
    let body = body.split('?').next()?;
    let host_port = body.rsplit_once('@').map_or(body, |(_, hp)| hp);
    let host_port = host_port.split('/').next()?;

    let (address, port) = if let Some(v6) = host_port.strip_prefix('[') {
        let (host, port) = v6.split_once("]:")?;
        (host.to_string(), port)
    } else {
        let (host, port) = host_port.rsplit_once(':')?;
        (host.to_string(), port)
    };
    if address.is_empty() {
        return None;
    }

    Some(ParsedLine {
        config_type,
        address,
        port: port.parse().ok()?,
        remarks,
    })
}

fn parse_vmess(payload: &str) -> Option<ParsedLine> {
    let raw = general_purpose::STANDARD
        .decode(payload.trim())
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(payload.trim()))
        .ok()?;
    let json: serde_json::Value = serde_json::from_slice(&raw).ok()?;

    let address = json["add"].as_str()?.to_string();
    let port = match &json["port"] {
        serde_json::Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
        serde_json::Value::String(s) => s.parse().ok()?,
        _ => return None,
    };

    Some(ParsedLine {
        config_type: ConfigType::Vmess,
        address,
        port,
        remarks: json["ps"].as_str().unwrap_or_default().to_string(),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
