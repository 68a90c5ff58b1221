//! Bounded, TTL-expiring persistence of received messages.
//!
//! The cache keeps the most recent messages first, trims beyond the
//! configured cap, and expires entries by age. It also persists the active
//! subscription set so a restarted client can pick up where it left off.
//! All durability goes through the [`Storage`] boundary; a missing key
//! simply means defaults.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use wavelink_protocol::Message;

use crate::storage::Storage;

/// Fixed storage keys for cache persistence.
pub mod keys {
    pub const MESSAGES: &str = "wavelink.cache.messages";
    pub const SUBSCRIPTIONS: &str = "wavelink.cache.subscriptions";
    pub const SETTINGS: &str = "wavelink.cache.settings";
}

/// Cache behavior settings, persisted alongside the cache itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Master switch for the whole cache layer.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether received messages are written through to the cache.
    #[serde(default = "default_true")]
    pub persist_messages: bool,

    /// Whether the subscription set is mirrored for restart recovery.
    #[serde(default = "default_true")]
    pub persist_subscriptions: bool,

    /// Maximum number of cached messages (at least 1).
    #[serde(default = "default_max_cached")]
    pub max_cached_messages: usize,

    /// Age limit in seconds; `0` means entries never expire by age.
    #[serde(default)]
    pub ttl_seconds: u64,

    /// When the last expiry sweep ran.
    #[serde(default = "Utc::now")]
    pub last_cleanup: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_max_cached() -> usize {
    200
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_messages: true,
            persist_subscriptions: true,
            max_cached_messages: default_max_cached(),
            ttl_seconds: 0,
            last_cleanup: Utc::now(),
        }
    }
}

/// A partial settings update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheUpdate {
    pub enabled: Option<bool>,
    pub persist_messages: Option<bool>,
    pub persist_subscriptions: Option<bool>,
    pub max_cached_messages: Option<usize>,
    pub ttl_seconds: Option<u64>,
}

/// A received message plus the wall-clock time of local receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub cached_at: DateTime<Utc>,
}

struct CacheInner {
    settings: CacheSettings,
    messages: VecDeque<CachedMessage>,
}

/// The message cache.
///
/// Most-recent-first ordering: `put` inserts at the front and trims the
/// tail beyond `max_cached_messages`.
pub struct CacheStore {
    storage: std::sync::Arc<dyn Storage>,
    inner: Mutex<CacheInner>,
}

impl CacheStore {
    /// Open the cache over a storage backend, hydrating persisted settings,
    /// messages, and nothing else. Persisted settings take precedence over
    /// `defaults`; a missing settings key means `defaults` apply.
    #[must_use]
    pub fn open(storage: std::sync::Arc<dyn Storage>, defaults: CacheSettings) -> Self {
        let mut settings = match storage.get(keys::SETTINGS) {
            Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable cache settings");
                defaults.clone()
            }),
            Ok(None) => defaults,
            Err(e) => {
                warn!(error = %e, "Failed to read cache settings, using defaults");
                defaults
            }
        };
        settings.max_cached_messages = settings.max_cached_messages.max(1);

        let messages = if settings.enabled && settings.persist_messages {
            match storage.get(keys::MESSAGES) {
                Ok(Some(raw)) => serde_json::from_slice::<Vec<CachedMessage>>(&raw)
                    .map(VecDeque::from)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Discarding unreadable cached messages");
                        VecDeque::new()
                    }),
                Ok(None) => VecDeque::new(),
                Err(e) => {
                    warn!(error = %e, "Failed to read cached messages");
                    VecDeque::new()
                }
            }
        } else {
            VecDeque::new()
        };

        debug!(
            hydrated = messages.len(),
            ttl_seconds = settings.ttl_seconds,
            "Cache opened"
        );

        Self {
            storage,
            inner: Mutex::new(CacheInner { settings, messages }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Write a received message through to the cache.
    ///
    /// Returns `false` without touching anything when the cache is disabled,
    /// message persistence is off, or the message carries `ttl = 0`
    /// ("do not archive/cache").
    pub fn put(&self, message: &Message) -> bool {
        let mut inner = self.lock();
        if !inner.settings.enabled || !inner.settings.persist_messages {
            return false;
        }
        if message.ttl == Some(0) {
            trace!(kind = %message.kind, "Skipping zero-ttl message");
            return false;
        }

        let now = Utc::now();
        inner.messages.push_front(CachedMessage {
            message: message.clone(),
            cached_at: now,
        });
        Self::sweep_inner(&mut inner, now);
        self.persist_messages_locked(&inner);
        true
    }

    /// Expire aged entries and enforce the size cap.
    ///
    /// Runs on a fixed interval and opportunistically on every `put`.
    pub fn sweep_expired(&self) {
        self.sweep_expired_at(Utc::now());
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        if !inner.settings.enabled {
            return;
        }
        let removed = Self::sweep_inner(&mut inner, now);
        if removed > 0 {
            debug!(removed, "Cache sweep expired entries");
        }
        self.persist_messages_locked(&inner);
        self.persist_settings_locked(&inner);
    }

    /// Expiry plus cap enforcement. Returns how many entries were dropped.
    fn sweep_inner(inner: &mut CacheInner, now: DateTime<Utc>) -> usize {
        let before = inner.messages.len();
        let ttl = inner.settings.ttl_seconds;
        if ttl > 0 {
            inner
                .messages
                .retain(|entry| (now - entry.cached_at).num_seconds() < ttl as i64);
        }
        // The size cap applies even when nothing has expired.
        let cap = inner.settings.max_cached_messages;
        inner.messages.truncate(cap);
        inner.settings.last_cleanup = now;
        before - inner.messages.len()
    }

    /// All cached messages, most recent first.
    #[must_use]
    pub fn messages(&self) -> Vec<CachedMessage> {
        self.lock().messages.iter().cloned().collect()
    }

    /// Cached messages scoped to `topic`, most recent first.
    #[must_use]
    pub fn get_by_topic(&self, topic: &str) -> Vec<CachedMessage> {
        self.lock()
            .messages
            .iter()
            .filter(|entry| entry.message.topic.as_deref() == Some(topic))
            .cloned()
            .collect()
    }

    /// Cached messages of the given type, most recent first.
    #[must_use]
    pub fn get_by_kind(&self, kind: &str) -> Vec<CachedMessage> {
        self.lock()
            .messages
            .iter()
            .filter(|entry| entry.message.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of cached messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// Whether the cache holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Drop all cached messages, leaving subscriptions and settings intact.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.messages.clear();
        self.persist_messages_locked(&inner);
        debug!("Cache cleared");
    }

    /// Full wipe: messages and the persisted subscription set.
    pub fn wipe(&self) {
        let mut inner = self.lock();
        inner.messages.clear();
        self.persist_messages_locked(&inner);
        if let Err(e) = self.storage.remove(keys::SUBSCRIPTIONS) {
            warn!(error = %e, "Failed to remove persisted subscriptions");
        }
        debug!("Cache wiped");
    }

    /// Apply a partial settings update and persist the result.
    ///
    /// Shrinking `max_cached_messages` trims the overflow immediately.
    pub fn update_settings(&self, update: CacheUpdate) -> CacheSettings {
        let mut inner = self.lock();
        if let Some(enabled) = update.enabled {
            inner.settings.enabled = enabled;
        }
        if let Some(persist) = update.persist_messages {
            inner.settings.persist_messages = persist;
        }
        if let Some(persist) = update.persist_subscriptions {
            inner.settings.persist_subscriptions = persist;
        }
        if let Some(max) = update.max_cached_messages {
            inner.settings.max_cached_messages = max.max(1);
        }
        if let Some(ttl) = update.ttl_seconds {
            inner.settings.ttl_seconds = ttl;
        }
        let cap = inner.settings.max_cached_messages;
        inner.messages.truncate(cap);
        self.persist_settings_locked(&inner);
        self.persist_messages_locked(&inner);
        inner.settings.clone()
    }

    /// Current settings snapshot.
    #[must_use]
    pub fn settings(&self) -> CacheSettings {
        self.lock().settings.clone()
    }

    /// Mirror the subscription set for restart recovery.
    pub fn save_subscriptions(&self, topics: &BTreeSet<String>) {
        let inner = self.lock();
        if !inner.settings.enabled || !inner.settings.persist_subscriptions {
            return;
        }
        match serde_json::to_vec(topics) {
            Ok(raw) => {
                if let Err(e) = self.storage.put(keys::SUBSCRIPTIONS, &raw) {
                    warn!(error = %e, "Failed to persist subscriptions");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize subscriptions"),
        }
    }

    /// Load the mirrored subscription set, or an empty set.
    #[must_use]
    pub fn load_subscriptions(&self) -> BTreeSet<String> {
        let inner = self.lock();
        if !inner.settings.enabled || !inner.settings.persist_subscriptions {
            return BTreeSet::new();
        }
        match self.storage.get(keys::SUBSCRIPTIONS) {
            Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable persisted subscriptions");
                BTreeSet::new()
            }),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read persisted subscriptions");
                BTreeSet::new()
            }
        }
    }

    fn persist_messages_locked(&self, inner: &CacheInner) {
        if !inner.settings.enabled || !inner.settings.persist_messages {
            return;
        }
        let snapshot: Vec<&CachedMessage> = inner.messages.iter().collect();
        match serde_json::to_vec(&snapshot) {
            Ok(raw) => {
                if let Err(e) = self.storage.put(keys::MESSAGES, &raw) {
                    warn!(error = %e, "Failed to persist cached messages");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize cached messages"),
        }
    }

    fn persist_settings_locked(&self, inner: &CacheInner) {
        match serde_json::to_vec(&inner.settings) {
            Ok(raw) => {
                if let Err(e) = self.storage.put(keys::SETTINGS, &raw) {
                    warn!(error = %e, "Failed to persist cache settings");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize cache settings"),
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CacheStore")
            .field("len", &inner.messages.len())
            .field("settings", &inner.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::Duration;
    use std::sync::Arc;

    fn store() -> CacheStore {
        CacheStore::open(Arc::new(MemoryStorage::new()), CacheSettings::default())
    }

    fn store_with(settings: CacheSettings) -> CacheStore {
        CacheStore::open(Arc::new(MemoryStorage::new()), settings)
    }

    fn msg(n: usize) -> Message {
        Message::new("topic_message")
            .with_topic("t")
            .with_id(format!("m-{n}"))
    }

    #[test]
    fn test_cache_bound_evicts_oldest() {
        let cache = store_with(CacheSettings {
            max_cached_messages: 10,
            ..CacheSettings::default()
        });

        for n in 0..15 {
            cache.put(&msg(n));
        }

        let cached = cache.messages();
        assert_eq!(cached.len(), 10);
        // Most recent first: m-14 down to m-5; the oldest five are gone.
        assert_eq!(cached[0].message.id.as_deref(), Some("m-14"));
        assert_eq!(cached[9].message.id.as_deref(), Some("m-5"));
    }

    #[test]
    fn test_ttl_expiry_sweep() {
        let cache = store_with(CacheSettings {
            ttl_seconds: 10,
            ..CacheSettings::default()
        });
        cache.put(&msg(0));
        let inserted_at = cache.messages()[0].cached_at;

        // Present just before the TTL boundary.
        cache.sweep_expired_at(inserted_at + Duration::seconds(9));
        assert_eq!(cache.len(), 1);

        // Absent after a sweep past it.
        cache.sweep_expired_at(inserted_at + Duration::seconds(11));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_zero_ttl_never_expires_by_age() {
        let cache = store(); // ttl_seconds = 0
        cache.put(&msg(0));
        let inserted_at = cache.messages()[0].cached_at;
        cache.sweep_expired_at(inserted_at + Duration::days(365));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_ttl_message_not_cached() {
        let cache = store();
        assert!(!cache.put(&msg(0).with_ttl(0)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_is_noop() {
        let cache = store_with(CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        });
        assert!(!cache.put(&msg(0)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_by_topic_and_kind() {
        let cache = store();
        cache.put(&Message::new("topic_message").with_topic("a"));
        cache.put(&Message::new("topic_message").with_topic("b"));
        cache.put(&Message::new("notification").with_topic("a"));

        assert_eq!(cache.get_by_topic("a").len(), 2);
        assert_eq!(cache.get_by_topic("b").len(), 1);
        assert_eq!(cache.get_by_kind("notification").len(), 1);
        assert_eq!(cache.get_by_kind("system").len(), 0);
    }

    #[test]
    fn test_update_settings_trims() {
        let cache = store();
        for n in 0..8 {
            cache.put(&msg(n));
        }
        let settings = cache.update_settings(CacheUpdate {
            max_cached_messages: Some(3),
            ..CacheUpdate::default()
        });
        assert_eq!(settings.max_cached_messages, 3);
        assert_eq!(cache.len(), 3);

        // A cap of zero is clamped to the minimum of one.
        let settings = cache.update_settings(CacheUpdate {
            max_cached_messages: Some(0),
            ..CacheUpdate::default()
        });
        assert_eq!(settings.max_cached_messages, 1);
    }

    #[test]
    fn test_hydration_across_restart() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let cache = CacheStore::open(storage.clone(), CacheSettings::default());
            cache.put(&msg(1));
            cache.put(&msg(2));
            cache.update_settings(CacheUpdate {
                ttl_seconds: Some(3600),
                ..CacheUpdate::default()
            });
        }
        let reopened = CacheStore::open(storage, CacheSettings::default());
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.settings().ttl_seconds, 3600);
        assert_eq!(reopened.messages()[0].message.id.as_deref(), Some("m-2"));
    }

    #[test]
    fn test_subscription_persistence() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let cache = CacheStore::open(storage.clone(), CacheSettings::default());

        let topics: BTreeSet<String> = ["alerts", "orders"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cache.save_subscriptions(&topics);
        assert_eq!(cache.load_subscriptions(), topics);

        // Survives a restart over the same storage.
        let reopened = CacheStore::open(storage, CacheSettings::default());
        assert_eq!(reopened.load_subscriptions(), topics);

        // A full wipe clears the mirrored set.
        reopened.wipe();
        assert!(reopened.load_subscriptions().is_empty());
    }

    #[test]
    fn test_clear_keeps_subscriptions() {
        let cache = store();
        let topics: BTreeSet<String> = ["alerts".to_string()].into_iter().collect();
        cache.save_subscriptions(&topics);
        cache.put(&msg(0));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.load_subscriptions(), topics);
    }
}
