//! The desired set of topic subscriptions.
//!
//! The registry is the single source of truth for what this client wants to
//! hear. It does not require a live connection to "want" a topic: mutations
//! apply locally whenever the control plane is unreachable and are replayed
//! as one batch after every successful (re)connect. Every mutation is
//! mirrored to the cache for restart recovery.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use wavelink_core::CacheStore;

use crate::control::ControlPlane;

/// Tracks the desired topic set. Owned exclusively by the connection actor.
pub struct SubscriptionRegistry {
    topics: BTreeSet<String>,
    cache: Arc<CacheStore>,
}

impl SubscriptionRegistry {
    /// Load the registry, hydrating any persisted set from the cache.
    #[must_use]
    pub fn load(cache: Arc<CacheStore>) -> Self {
        let topics = cache.load_subscriptions();
        if !topics.is_empty() {
            info!(count = topics.len(), "Restored persisted subscriptions");
        }
        Self { topics, cache }
    }

    /// Whether a topic is in the set.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// The current topic set, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().cloned().collect()
    }

    /// Number of subscribed topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Add a topic to the set, mirroring to the cache.
    ///
    /// Returns `false` if it was already present.
    pub fn insert(&mut self, topic: &str) -> bool {
        let added = self.topics.insert(topic.to_string());
        if added {
            debug!(topic = %topic, "Topic added to subscription set");
            self.cache.save_subscriptions(&self.topics);
        }
        added
    }

    /// Remove a topic from the set, mirroring to the cache.
    ///
    /// Returns `false` if it was not present.
    pub fn remove(&mut self, topic: &str) -> bool {
        let removed = self.topics.remove(topic);
        if removed {
            debug!(topic = %topic, "Topic removed from subscription set");
            self.cache.save_subscriptions(&self.topics);
        }
        removed
    }

    /// Replay the whole set against the control plane as one batched call.
    ///
    /// Called once per successful (re)connect so handlers never observe a
    /// partially-resubscribed state. A no-op on an empty set. Failure leaves
    /// the set untouched; the next reconnect replays it again.
    pub async fn resubscribe_all(&self, control: &dyn ControlPlane, client_id: &str) -> bool {
        if self.topics.is_empty() {
            return true;
        }
        let topics = self.topics();
        match control.subscribe_batch(client_id, &topics).await {
            Ok(response) if response.success => {
                info!(count = topics.len(), "Resubscribed after reconnect");
                true
            }
            Ok(response) => {
                warn!(
                    reason = response.message.as_deref().unwrap_or("unknown"),
                    "Batched resubscribe rejected"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, "Batched resubscribe failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics)
            .finish()
    }
}
