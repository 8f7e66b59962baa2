//! Score persistence: scoreboard snapshots backed by SQLite.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::pool::scoreboard::ServerScore;

pub struct ScoreRepository {
    db: Mutex<Connection>,
}

impl ScoreRepository {
    /// Open (or create) the score database at the given path.
    pub fn open(db_path: &Path) -> rusqlite::Result<Self> {
        let db = Connection::open(db_path)?;
        db.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(db)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> rusqlite::Result<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS server_scores (
                server_id TEXT PRIMARY KEY,
                delay_ms INTEGER NOT NULL DEFAULT -1,
                speed REAL NOT NULL DEFAULT -1,
                score INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Load every persisted score.
    pub fn load(&self) -> rusqlite::Result<Vec<ServerScore>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare(
            "SELECT server_id, delay_ms, speed, score, updated_at FROM server_scores ORDER BY server_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let updated_at: String = row.get(4)?;
            Ok(ServerScore {
                server_id: row.get(0)?,
                delay_ms: row.get(1)?,
                speed: row.get(2)?,
                score: row.get(3)?,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect()
    }

    /// Replace the stored set with `scores` in one transaction. Entries
    /// missing from the snapshot are deleted.
    pub fn save(&self, scores: &HashMap<String, ServerScore>) -> rusqlite::Result<usize> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = db.transaction()?;
        tx.execute("DELETE FROM server_scores", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO server_scores (server_id, delay_ms, speed, score, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for s in scores.values() {
                stmt.execute(params![
                    s.server_id,
                    s.delay_ms,
                    s.speed,
                    s.score,
                    s.updated_at.to_rfc3339()
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(count = scores.len(), "Scores persisted");
        Ok(scores.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, delay: i64, score: i64) -> ServerScore {
        let mut s = ServerScore::new(id);
        s.delay_ms = delay;
        s.score = score;
        s
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScoreRepository::open(&dir.path().join("scores.db")).unwrap();

        let mut scores = HashMap::new();
        scores.insert("a".to_string(), sample("a", 80, 3));
        scores.insert("b".to_string(), sample("b", -1, -2));
        assert_eq!(repo.save(&scores).unwrap(), 2);

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].server_id, "a");
        assert_eq!((loaded[0].delay_ms, loaded[0].score), (80, 3));
        assert_eq!(loaded[0].speed, -1.0);
        assert_eq!(loaded[1].score, -2);
    }

    #[test]
    fn test_save_drops_missing_entries() {
        let repo = ScoreRepository::in_memory().unwrap();
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), sample("a", 1, 1));
        scores.insert("b".to_string(), sample("b", 1, 1));
        repo.save(&scores).unwrap();

        scores.remove("a");
        repo.save(&scores).unwrap();
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].server_id, "b");
    }
}
