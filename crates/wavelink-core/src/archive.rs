//! In-memory archive of recent messages for inspection and replay.
//!
//! Unlike the cache, the archive never persists: it is a set of
//! fixed-capacity ring buffers keyed by `global`, `topic:<name>`, and
//! `kind:<name>`, holding the most recent messages first.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::trace;
use wavelink_protocol::{Message, Priority};

/// Default ring-buffer capacity per keyspace.
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 100;

/// A logical archive keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArchiveKey {
    Global,
    Topic(String),
    Kind(String),
}

impl ArchiveKey {
    /// Parse an archive key from its string form: `global`, `topic:<name>`,
    /// or `kind:<name>`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "global" {
            return Some(ArchiveKey::Global);
        }
        if let Some(topic) = raw.strip_prefix("topic:") {
            if !topic.is_empty() {
                return Some(ArchiveKey::Topic(topic.to_string()));
            }
        }
        if let Some(kind) = raw.strip_prefix("kind:") {
            if !kind.is_empty() {
                return Some(ArchiveKey::Kind(kind.to_string()));
            }
        }
        None
    }
}

impl std::fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveKey::Global => write!(f, "global"),
            ArchiveKey::Topic(topic) => write!(f, "topic:{topic}"),
            ArchiveKey::Kind(kind) => write!(f, "kind:{kind}"),
        }
    }
}

/// Bounded message archive.
pub struct ArchiveStore {
    buffers: DashMap<ArchiveKey, VecDeque<Message>>,
    capacity: usize,
}

impl ArchiveStore {
    /// Create an archive with the default per-keyspace capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ARCHIVE_CAPACITY)
    }

    /// Create an archive with a specific per-keyspace capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Archive a message under `global`, its topic, and its type.
    ///
    /// Skipped for zero-ttl messages unless the priority is `critical`,
    /// which is always archived. Returns whether the message was stored.
    pub fn archive(&self, message: &Message) -> bool {
        if message.priority != Priority::Critical && message.ttl == Some(0) {
            trace!(kind = %message.kind, "Skipping zero-ttl message");
            return false;
        }

        self.push(ArchiveKey::Global, message);
        if let Some(topic) = &message.topic {
            self.push(ArchiveKey::Topic(topic.clone()), message);
        }
        self.push(ArchiveKey::Kind(message.kind.clone()), message);
        true
    }

    fn push(&self, key: ArchiveKey, message: &Message) {
        let mut buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(16)));
        buffer.push_front(message.clone());
        buffer.truncate(self.capacity);
    }

    /// Archived messages under `key`, most recent first.
    #[must_use]
    pub fn get(&self, key: &ArchiveKey) -> Vec<Message> {
        self.buffers
            .get(key)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of archived messages under `key`.
    #[must_use]
    pub fn len(&self, key: &ArchiveKey) -> usize {
        self.buffers.get(key).map_or(0, |buffer| buffer.len())
    }

    /// Whether nothing has been archived under `key`.
    #[must_use]
    pub fn is_empty(&self, key: &ArchiveKey) -> bool {
        self.len(key) == 0
    }

    /// Clear one keyspace, or everything when `key` is `None`.
    pub fn clear(&self, key: Option<&ArchiveKey>) {
        match key {
            Some(key) => {
                self.buffers.remove(key);
            }
            None => self.buffers.clear(),
        }
    }

    /// Count of globally-archived messages whose timestamp falls within the
    /// trailing `window` ending at `now`. Feeds the message-rate statistic.
    #[must_use]
    pub fn recent_global_count(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - window;
        self.buffers
            .get(&ArchiveKey::Global)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|message| message.timestamp > cutoff)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for ArchiveStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("keyspaces", &self.buffers.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
