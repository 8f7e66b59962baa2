//! Status and result notifications.
//!
//! Two channels, both fire-and-forget:
//! - a status callback `(is_final, message)` injected at registration;
//! - a broadcast of structured [`PoolEvent`]s for per-server results.
//!
//! Nothing waits for a listener. Events sent with no subscriber are
//! dropped.

use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::info;

/// Status callback: `(is_final, message)`.
pub type StatusCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;

const EVENT_CAPACITY: usize = 1024;

/// Which view a consumer should reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshKind {
    /// Groups / subscriptions changed (after a harvest).
    Subscriptions,
    /// The server list order or contents changed.
    Profiles,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    ScoreResult { server_id: String, delay_ms: i64, score: i64 },
    SpeedResult { server_id: String, speed: f64 },
    RefreshNeeded { kind: RefreshKind },
}

#[derive(Clone)]
pub struct Notifier {
    status: Arc<RwLock<Option<StatusCallback>>>,
    events: broadcast::Sender<PoolEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            status: Arc::new(RwLock::new(None)),
            events,
        }
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn status(&self, is_final: bool, message: &str) {
        info!(is_final, "{}", message);
        let callback = self.status.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(cb) = callback {
            cb(is_final, message);
        }
    }

    pub fn score_result(&self, server_id: &str, delay_ms: i64, score: i64) {
        self.emit(PoolEvent::ScoreResult {
            server_id: server_id.to_string(),
            delay_ms,
            score,
        });
    }

    pub fn speed_result(&self, server_id: &str, speed: f64) {
        self.emit(PoolEvent::SpeedResult {
            server_id: server_id.to_string(),
            speed,
        });
    }

    pub fn refresh_needed(&self, kind: RefreshKind) {
        self.emit(PoolEvent::RefreshNeeded { kind });
    }

    fn emit(&self, event: PoolEvent) {
        // Err only means nobody is listening.
        let _ = self.events.send(event);
    }
}
