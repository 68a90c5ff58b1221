//! Handler fan-out for inbound messages.
//!
//! The router demultiplexes every received message to registered handlers
//! by topic, priority, exact type, and a generic catch-all, after writing
//! it through to the cache and archive. Filters gate delivery to handlers,
//! never durability. Heartbeat frames are intercepted and go nowhere.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, error, trace, warn};
use wavelink_protocol::{Message, Priority};

use crate::archive::ArchiveStore;
use crate::cache::CacheStore;

/// A registered message handler.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// A registered delivery filter.
pub type Filter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Key a handler registers under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    /// Exact message type, e.g. `"notification"`.
    Kind(String),
    /// All messages on a topic: `"topic:<name>"`.
    Topic(String),
    /// All messages at a priority: `"priority:<level>"`.
    Priority(Priority),
    /// The generic `"message"` catch-all.
    Any,
}

impl DispatchKey {
    /// Parse a registration key from its string form.
    ///
    /// `"message"` is the catch-all; `topic:` and `priority:` prefixes are
    /// recognized; anything else is an exact message type. An unknown
    /// priority level falls back to an exact-type key so a typo registers
    /// something inert rather than silently matching everything.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == "message" {
            return DispatchKey::Any;
        }
        if let Some(topic) = raw.strip_prefix("topic:") {
            return DispatchKey::Topic(topic.to_string());
        }
        if let Some(level) = raw.strip_prefix("priority:") {
            match Priority::parse(level) {
                Some(priority) => return DispatchKey::Priority(priority),
                None => {
                    warn!(key = %raw, "Unknown priority level in dispatch key");
                    return DispatchKey::Kind(raw.to_string());
                }
            }
        }
        DispatchKey::Kind(raw.to_string())
    }
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Heartbeat frame: intercepted, not stored, not delivered.
    Heartbeat,
    /// A filter rejected the message; stored but not delivered.
    Suppressed,
    /// Delivered to this many handlers (possibly zero).
    Delivered(usize),
}

struct Registrations {
    handlers: DashMap<DispatchKey, Vec<(u64, Handler)>>,
    filters: DashMap<String, (u64, Filter)>,
    next_id: AtomicU64,
}

/// Unregisters its handler when dropped.
pub struct HandlerGuard {
    registrations: Weak<Registrations>,
    key: DispatchKey,
    id: u64,
}

impl HandlerGuard {
    /// Explicitly unregister the handler.
    pub fn unregister(self) {}
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(registrations) = self.registrations.upgrade() {
            if let Some(mut entry) = registrations.handlers.get_mut(&self.key) {
                entry.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Unregisters its filter when dropped.
pub struct FilterGuard {
    registrations: Weak<Registrations>,
    name: String,
    id: u64,
}

impl FilterGuard {
    /// Explicitly unregister the filter.
    pub fn unregister(self) {}
}

impl Drop for FilterGuard {
    fn drop(&mut self) {
        if let Some(registrations) = self.registrations.upgrade() {
            // Only remove if the slot still belongs to this guard; a newer
            // filter registered under the same name stays.
            registrations
                .filters
                .remove_if(&self.name, |_, (id, _)| *id == self.id);
        }
    }
}

/// The message router.
pub struct MessageRouter {
    registrations: Arc<Registrations>,
    cache: Arc<CacheStore>,
    archive: Arc<ArchiveStore>,
}

impl MessageRouter {
    /// Create a router writing through to the given stores.
    #[must_use]
    pub fn new(cache: Arc<CacheStore>, archive: Arc<ArchiveStore>) -> Self {
        Self {
            registrations: Arc::new(Registrations {
                handlers: DashMap::new(),
                filters: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
            cache,
            archive,
        }
    }

    /// Register a handler under a raw key (`"message"`, `"topic:<name>"`,
    /// `"priority:<level>"`, or an exact message type).
    #[must_use]
    pub fn register(&self, key: &str, handler: impl Fn(&Message) + Send + Sync + 'static) -> HandlerGuard {
        self.register_key(DispatchKey::parse(key), handler)
    }

    /// Register a handler under an already-parsed key.
    #[must_use]
    pub fn register_key(
        &self,
        key: DispatchKey,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> HandlerGuard {
        let id = self.registrations.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .handlers
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        trace!(key = ?key, id, "Handler registered");
        HandlerGuard {
            registrations: Arc::downgrade(&self.registrations),
            key,
            id,
        }
    }

    /// Register a named delivery filter. If any filter rejects a message,
    /// handler dispatch is suppressed for it; write-through still happens.
    /// Re-registering a name replaces the previous predicate.
    #[must_use]
    pub fn register_filter(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> FilterGuard {
        let name = name.into();
        let id = self.registrations.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .filters
            .insert(name.clone(), (id, Arc::new(predicate)));
        trace!(filter = %name, id, "Filter registered");
        FilterGuard {
            registrations: Arc::downgrade(&self.registrations),
            name,
            id,
        }
    }

    /// Number of live handlers under a raw key.
    #[must_use]
    pub fn handler_count(&self, key: &str) -> usize {
        self.registrations
            .handlers
            .get(&DispatchKey::parse(key))
            .map_or(0, |entry| entry.len())
    }

    /// Route one inbound message.
    ///
    /// Heartbeats are intercepted. Everything else is written through to
    /// the cache and archive, gated by filters, then fanned out in fixed
    /// order: topic handlers, priority handlers, type handlers, generic
    /// handlers. A panicking handler is contained and logged; delivery to
    /// the remaining handlers continues.
    pub fn dispatch(&self, message: &Message) -> DispatchOutcome {
        if message.is_heartbeat() {
            trace!(kind = %message.kind, "Heartbeat intercepted");
            return DispatchOutcome::Heartbeat;
        }

        self.cache.put(message);
        self.archive.archive(message);

        if !self.passes_filters(message) {
            debug!(kind = %message.kind, "Message suppressed by filter");
            return DispatchOutcome::Suppressed;
        }

        let mut delivered = 0;
        for key in self.dispatch_keys(message) {
            for handler in self.handlers_for(&key) {
                let result = catch_unwind(AssertUnwindSafe(|| handler(message)));
                if result.is_err() {
                    error!(key = ?key, "Handler panicked during dispatch");
                } else {
                    delivered += 1;
                }
            }
        }
        DispatchOutcome::Delivered(delivered)
    }

    /// The fan-out order for a message.
    fn dispatch_keys(&self, message: &Message) -> Vec<DispatchKey> {
        let mut keys = Vec::with_capacity(4);
        if let Some(topic) = &message.topic {
            keys.push(DispatchKey::Topic(topic.clone()));
        }
        keys.push(DispatchKey::Priority(message.priority));
        keys.push(DispatchKey::Kind(message.kind.clone()));
        keys.push(DispatchKey::Any);
        keys
    }

    /// Snapshot the handlers under a key so none of the registry locks are
    /// held while user code runs (handlers may register or unregister).
    fn handlers_for(&self, key: &DispatchKey) -> Vec<Handler> {
        self.registrations
            .handlers
            .get(key)
            .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    fn passes_filters(&self, message: &Message) -> bool {
        let filters: Vec<(String, Filter)> = self
            .registrations
            .filters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().1.clone()))
            .collect();

        for (name, filter) in filters {
            match catch_unwind(AssertUnwindSafe(|| filter(message))) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(_) => {
                    // A crashing filter must not black-hole delivery.
                    error!(filter = %name, "Filter panicked; treating as pass");
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("handler_keys", &self.registrations.handlers.len())
            .field("filters", &self.registrations.filters.len())
            .finish()
    }
}
