//! Shared scoreboard: rolling per-server measurements.
//!
//! Written concurrently by the score cycle's probe workers, so every
//! mutation is a single read-modify-write under the write lock. Entries
//! are created lazily on the first measurement and dropped when their
//! server is pruned or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;

/// Latency sentinel for "untested or failed".
pub const UNTESTED_DELAY: i64 = -1;
/// Speed sentinel for "untested".
pub const UNTESTED_SPEED: f64 = -1.0;

/// Rolling measurement state for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerScore {
    pub server_id: String,
    /// Round-trip latency in milliseconds, or [`UNTESTED_DELAY`].
    pub delay_ms: i64,
    /// Download throughput in MB/s, or [`UNTESTED_SPEED`].
    pub speed: f64,
    /// +1 per successful probe, -1 per failed probe. Unbounded.
    pub score: i64,
    pub updated_at: DateTime<Utc>,
}

impl ServerScore {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            delay_ms: UNTESTED_DELAY,
            speed: UNTESTED_SPEED,
            score: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn has_latency(&self) -> bool {
        self.delay_ms >= 0
    }
}

#[derive(Default)]
pub struct Scoreboard {
    entries: RwLock<HashMap<String, ServerScore>>,
}

impl Scoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted scores.
    pub fn from_scores(scores: impl IntoIterator<Item = ServerScore>) -> Self {
        let entries = scores.into_iter().map(|s| (s.server_id.clone(), s)).collect();
        Self { entries: RwLock::new(entries) }
    }

    pub fn get(&self, server_id: &str) -> Option<ServerScore> {
        self.read().get(server_id).cloned()
    }

    /// Current score; an absent entry counts as 0.
    pub fn score(&self, server_id: &str) -> i64 {
        self.read().get(server_id).map_or(0, |s| s.score)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Apply one latency probe outcome. `None` is a failure: latency goes
    /// to the sentinel and the score drops by one; a measured latency
    /// raises the score by one.
    pub fn record_latency(&self, server_id: &str, latency_ms: Option<u64>) -> ServerScore {
        let mut map = self.write();
        let entry = map
            .entry(server_id.to_string())
            .or_insert_with(|| ServerScore::new(server_id));
        match latency_ms {
            Some(ms) => {
                entry.delay_ms = i64::try_from(ms).unwrap_or(i64::MAX);
                entry.score += 1;
            }
            None => {
                entry.delay_ms = UNTESTED_DELAY;
                entry.score -= 1;
            }
        }
        entry.updated_at = Utc::now();
        entry.clone()
    }

    /// Record a failure only if the entry has not been touched since
    /// `since`. Used for probe workers that died before reporting.
    pub fn record_failure_if_stale(&self, server_id: &str, since: DateTime<Utc>) -> Option<ServerScore> {
        let fresh = self
            .read()
            .get(server_id)
            .is_some_and(|s| s.updated_at >= since);
        if fresh {
            return None;
        }
        Some(self.record_latency(server_id, None))
    }

    pub fn reset_speed(&self, server_id: &str) {
        let mut map = self.write();
        let entry = map
            .entry(server_id.to_string())
            .or_insert_with(|| ServerScore::new(server_id));
        entry.speed = UNTESTED_SPEED;
        entry.updated_at = Utc::now();
    }

    /// Store a throughput reading. Readings `<= 0` are not recorded.
    pub fn record_speed(&self, server_id: &str, speed: f64) -> bool {
        // NaN fails every comparison, so it is rejected explicitly.
        if speed.is_nan() || speed <= 0.0 {
            return false;
        }
        let mut map = self.write();
        let entry = map
            .entry(server_id.to_string())
            .or_insert_with(|| ServerScore::new(server_id));
        entry.speed = speed;
        entry.updated_at = Utc::now();
        true
    }

    /// Overwrite a score directly (imports, tests).
    pub fn set_score(&self, server_id: &str, score: i64) {
        let mut map = self.write();
        let entry = map
            .entry(server_id.to_string())
            .or_insert_with(|| ServerScore::new(server_id));
        entry.score = score;
        entry.updated_at = Utc::now();
    }

    /// Ids whose score dropped below zero.
    pub fn negative_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .values()
            .filter(|s| s.score < 0)
            .map(|s| s.server_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn remove(&self, server_ids: &[String]) -> usize {
        let mut map = self.write();
        server_ids.iter().filter(|id| map.remove(id.as_str()).is_some()).count()
    }

    /// Top `k` entries with a measured latency, ranked by score
    /// descending then latency ascending.
    pub fn shortlist(&self, k: usize) -> Vec<ServerScore> {
        let mut ranked: Vec<ServerScore> = self
            .read()
            .values()
            .filter(|s| s.has_latency())
            .cloned()
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.delay_ms.cmp(&b.delay_ms))
                .then_with(|| a.server_id.cmp(&b.server_id))
        });
        ranked.truncate(k);
        ranked
    }

    pub fn snapshot(&self) -> HashMap<String, ServerScore> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ServerScore>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ServerScore>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Active Selection ────────────────────────────────────────────────

/// The single server currently designated as live.
///
/// Backed by a watch channel: the compare, the store write and the
/// value update run under the channel's lock, and subscribers see every
/// change.
pub struct ActiveSelection {
    tx: watch::Sender<Option<String>>,
}

impl ActiveSelection {
    pub fn new(initial: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    /// Switch to `server_id` unless it is already active. `commit` runs
    /// first, under the lock; the value changes only if it succeeds.
    /// Returns whether a switch happened.
    pub fn promote<E>(
        &self,
        server_id: &str,
        commit: impl FnOnce(&str) -> Result<(), E>,
    ) -> Result<bool, E> {
        let mut outcome = Ok(false);
        self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(server_id) {
                return false;
            }
            match commit(server_id) {
                Ok(()) => {
                    *current = Some(server_id.to_string());
                    outcome = Ok(true);
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// Clear the selection if it is `server_id`. Returns whether it was.
    pub fn clear_if(&self, server_id: &str) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_deref() != Some(server_id) {
                return false;
            }
            *current = None;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_latency_adjusts_score() {
        let board = Scoreboard::new();
        let s = board.record_latency("a", Some(120));
        assert_eq!((s.delay_ms, s.score), (120, 1));

        let s = board.record_latency("a", None);
        assert_eq!((s.delay_ms, s.score), (UNTESTED_DELAY, 0));

        let s = board.record_latency("a", None);
        assert_eq!(s.score, -1);
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let board = Arc::new(Scoreboard::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let board = Arc::clone(&board);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        board.record_latency("shared", if i % 2 == 0 { Some(5) } else { None });
                        board.record_latency("up", Some(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(board.score("shared"), 0);
        assert_eq!(board.score("up"), 2000);
    }

    #[test]
    fn test_speed_ignores_non_positive() {
        let board = Scoreboard::new();
        assert!(board.record_speed("a", 12.5));
        assert!(!board.record_speed("a", 0.0));
        assert!(!board.record_speed("a", -1.0));
        assert!(!board.record_speed("a", f64::NAN));
        assert_eq!(board.get("a").unwrap().speed, 12.5);
    }

    #[test]
    fn test_shortlist_ranking() {
        let board = Scoreboard::new();
        board.record_latency("slow", Some(300));
        board.record_latency("fast", Some(50));
        board.record_latency("best", Some(400));
        board.record_latency("best", Some(400));
        board.record_latency("dead", None);

        let ids: Vec<_> = board.shortlist(10).into_iter().map(|s| s.server_id).collect();
        assert_eq!(ids, vec!["best", "fast", "slow"]);
        assert_eq!(board.shortlist(1).len(), 1);
    }

    #[test]
    fn test_failure_if_stale_skips_fresh_entries() {
        let board = Scoreboard::new();
        let start = Utc::now();
        board.record_latency("a", Some(10));
        assert!(board.record_failure_if_stale("a", start).is_none());
        assert_eq!(board.score("a"), 1);

        let s = board.record_failure_if_stale("b", start).unwrap();
        assert_eq!(s.score, -1);
    }

    #[test]
    fn test_negative_ids_and_remove() {
        let board = Scoreboard::new();
        board.set_score("x", -1);
        board.set_score("y", 0);
        board.set_score("z", 5);
        assert_eq!(board.negative_ids(), vec!["x"]);
        assert_eq!(board.remove(&["x".to_string(), "nope".to_string()]), 1);
        assert_eq!(board.len(), 2);
    }

    #[test]
    fn test_promote_only_on_change() {
        let active = ActiveSelection::new(Some("a".into()));
        let mut rx = active.subscribe();
        let mut writes = 0;

        let switched = active
            .promote("a", |_| -> Result<(), ()> {
                writes += 1;
                Ok(())
            })
            .unwrap();
        assert!(!switched);
        assert_eq!(writes, 0);
        assert!(!rx.has_changed().unwrap());

        let switched = active.promote("b", |_| -> Result<(), ()> { Ok(()) }).unwrap();
        assert!(switched);
        assert_eq!(active.current().as_deref(), Some("b"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_deref(), Some("b"));
    }

    #[test]
    fn test_clear_if_only_matches_current() {
        let active = ActiveSelection::new(Some("a".into()));
        let mut rx = active.subscribe();

        assert!(!active.clear_if("b"));
        assert!(!rx.has_changed().unwrap());
        assert!(active.clear_if("a"));
        assert_eq!(active.current(), None);
        assert_eq!(*rx.borrow_and_update(), None);
        assert!(!active.clear_if("a"));
    }

    #[test]
    fn test_promote_keeps_value_when_commit_fails() {
        let active = ActiveSelection::new(None);
        let result = active.promote("b", |_| Err("store down"));
        assert_eq!(result, Err("store down"));
        assert_eq!(active.current(), None);
    }
}
