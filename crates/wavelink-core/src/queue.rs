//! FIFO of outbound publishes awaiting connectivity.
//!
//! Publish and broadcast requests attempted while the connection is down
//! (or the network is flagged offline) land here and are flushed in
//! submission order once the client reconnects. Flush policy is
//! drop-on-dispatch: an entry leaves the queue when its network call has
//! been issued, whether or not that call ultimately succeeds.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;
use wavelink_protocol::{Message, PublishOptions};

/// Default bound on pending entries.
pub const DEFAULT_MAX_PENDING: usize = 256;

/// One outbound publish waiting for connectivity.
#[derive(Debug, Clone)]
pub struct PendingPublish {
    /// Target topic; `None` means broadcast.
    pub topic: Option<String>,
    /// Payload.
    pub data: Value,
    /// Delivery options.
    pub options: PublishOptions,
    /// Locally-generated id, shared with the optimistic echo.
    pub local_id: String,
    /// When the entry was queued.
    pub queued_at: DateTime<Utc>,
}

impl PendingPublish {
    /// Synthesize the optimistic local echo for this entry, tagged with the
    /// `offline` marker and the entry's local id.
    #[must_use]
    pub fn local_echo(&self, sender: &str) -> Message {
        let mut echo = Message::local_echo(self.topic.as_deref(), self.data.clone(), &self.options, sender);
        echo.id = Some(self.local_id.clone());
        echo
    }
}

/// Bounded FIFO of pending publishes.
///
/// Owned exclusively by the connection actor; no internal locking.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<PendingPublish>,
    max_pending: usize,
}

impl OfflineQueue {
    /// Create a queue with the default bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }

    /// Create a queue bounded at `max_pending` entries.
    #[must_use]
    pub fn with_capacity(max_pending: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Append a publish request, evicting the oldest entry on overflow.
    ///
    /// Returns the queued entry (cloned) so the caller can route its local
    /// echo through the message router.
    pub fn enqueue(
        &mut self,
        topic: Option<String>,
        data: Value,
        options: PublishOptions,
    ) -> PendingPublish {
        if self.entries.len() >= self.max_pending {
            if let Some(dropped) = self.entries.pop_front() {
                warn!(
                    topic = dropped.topic.as_deref().unwrap_or("<broadcast>"),
                    "Offline queue full, dropping oldest entry"
                );
            }
        }

        let entry = PendingPublish {
            topic,
            data,
            options,
            local_id: Uuid::new_v4().to_string(),
            queued_at: Utc::now(),
        };
        self.entries.push_back(entry.clone());
        debug!(
            pending = self.entries.len(),
            topic = entry.topic.as_deref().unwrap_or("<broadcast>"),
            "Publish queued while offline"
        );
        entry
    }

    /// Remove and return the oldest entry.
    pub fn pop_front(&mut self) -> Option<PendingPublish> {
        self.entries.pop_front()
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every pending entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifo_order() {
        let mut queue = OfflineQueue::new();
        queue.enqueue(Some("first".into()), json!(1), PublishOptions::default());
        queue.enqueue(Some("second".into()), json!(2), PublishOptions::default());
        queue.enqueue(None, json!(3), PublishOptions::default());

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front().unwrap().topic.as_deref(), Some("first"));
        assert_eq!(queue.pop_front().unwrap().topic.as_deref(), Some("second"));
        assert_eq!(queue.pop_front().unwrap().topic, None);
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = OfflineQueue::with_capacity(2);
        queue.enqueue(Some("a".into()), json!(null), PublishOptions::default());
        queue.enqueue(Some("b".into()), json!(null), PublishOptions::default());
        queue.enqueue(Some("c".into()), json!(null), PublishOptions::default());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().topic.as_deref(), Some("b"));
        assert_eq!(queue.pop_front().unwrap().topic.as_deref(), Some("c"));
    }

    #[test]
    fn test_local_echo_shares_id() {
        let mut queue = OfflineQueue::new();
        let entry = queue.enqueue(
            Some("alerts".into()),
            json!({"text": "hi"}),
            PublishOptions::default(),
        );
        let echo = entry.local_echo("client-1");

        assert_eq!(echo.id.as_deref(), Some(entry.local_id.as_str()));
        assert_eq!(echo.topic.as_deref(), Some("alerts"));
        assert_eq!(echo.sender.as_deref(), Some("client-1"));
        assert_eq!(
            echo.metadata.unwrap().get("offline"),
            Some(&serde_json::Value::Bool(true))
        );
    }
}
