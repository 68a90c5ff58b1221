//! Counters and connection history for observability.
//!
//! The collector aggregates monotonic counters and a bounded history of
//! connection events; consumers only ever see immutable snapshots.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::ArchiveStore;

/// Maximum retained connection-history entries.
pub const HISTORY_CAP: usize = 50;

/// What happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionAction {
    Connect,
    Disconnect,
    Reconnect,
    Error,
}

/// One entry in the connection history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: ConnectionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Length of the connection that just ended, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ConnectionHistoryEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn now(action: ConnectionAction) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            reason: None,
            duration_ms: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach the ended connection's duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Non-heartbeat messages received over the stream.
    pub messages_received: u64,
    /// Connection attempts since construction.
    pub connection_attempts: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    /// Seconds connected so far, when currently connected.
    pub uptime_seconds: Option<u64>,
    /// Messages per second over the trailing minute, from the global archive.
    pub message_rate: f64,
}

struct StatsInner {
    messages_received: u64,
    connection_attempts: u64,
    last_connected_at: Option<DateTime<Utc>>,
    last_disconnected_at: Option<DateTime<Utc>>,
    connected_since: Option<DateTime<Utc>>,
    history: VecDeque<ConnectionHistoryEntry>,
}

/// Aggregates counters and the connection-history feed.
pub struct StatsCollector {
    inner: Mutex<StatsInner>,
}

impl StatsCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                messages_received: 0,
                connection_attempts: 0,
                last_connected_at: None,
                last_disconnected_at: None,
                connected_since: None,
                history: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Count one received (non-heartbeat) message.
    pub fn record_message(&self) {
        self.lock().messages_received += 1;
    }

    /// Count one connection attempt.
    pub fn record_attempt(&self) {
        self.lock().connection_attempts += 1;
    }

    /// Append a history entry, updating the connect/disconnect marks.
    pub fn record_history(&self, entry: ConnectionHistoryEntry) {
        let mut inner = self.lock();
        match entry.action {
            ConnectionAction::Connect => {
                inner.last_connected_at = Some(entry.timestamp);
                inner.connected_since = Some(entry.timestamp);
            }
            ConnectionAction::Disconnect | ConnectionAction::Error => {
                inner.last_disconnected_at = Some(entry.timestamp);
                inner.connected_since = None;
            }
            ConnectionAction::Reconnect => {}
        }
        debug!(action = ?entry.action, reason = entry.reason.as_deref().unwrap_or(""), "Connection event");
        inner.history.push_back(entry);
        while inner.history.len() > HISTORY_CAP {
            inner.history.pop_front();
        }
    }

    /// The history log, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ConnectionHistoryEntry> {
        self.lock().history.iter().cloned().collect()
    }

    /// Take an immutable snapshot; the message rate is computed from the
    /// archive's trailing-minute global window.
    #[must_use]
    pub fn snapshot(&self, archive: &ArchiveStore) -> StatsSnapshot {
        let now = Utc::now();
        let inner = self.lock();
        let recent = archive.recent_global_count(Duration::seconds(60), now);
        StatsSnapshot {
            messages_received: inner.messages_received,
            connection_attempts: inner.connection_attempts,
            last_connected_at: inner.last_connected_at,
            last_disconnected_at: inner.last_disconnected_at,
            uptime_seconds: inner
                .connected_since
                .map(|since| (now - since).num_seconds().max(0) as u64),
            message_rate: recent as f64 / 60.0,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("StatsCollector")
            .field("messages_received", &inner.messages_received)
            .field("connection_attempts", &inner.connection_attempts)
            .field("history_len", &inner.history.len())
            .finish()
    }
}
