//! The message pushed over the upstream stream.
//!
//! Messages are created by the server (or synthesized locally for
//! optimistic offline echoes) and handed to the router on receipt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Well-known message type discriminators.
pub mod kinds {
    pub const BROADCAST: &str = "broadcast";
    pub const TOPIC_MESSAGE: &str = "topic_message";
    pub const SYSTEM: &str = "system";
    pub const NOTIFICATION: &str = "notification";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Delivery priority of a message.
///
/// `Critical` messages are always archived, regardless of their `ttl`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Parse a priority level from its wire name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// The wire name of this level.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of communication on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Type discriminator, e.g. `"broadcast"` or `"topic_message"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Opaque payload.
    #[serde(default)]
    pub data: Value,

    /// Topic scope, present for topic-scoped messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Server-assigned creation time (receipt time for local echoes).
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Unique identifier, client- or server-assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Delivery priority. Defaults to `normal`.
    #[serde(default)]
    pub priority: Priority,

    /// Time-to-live in seconds. `0` means "do not archive/cache".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    /// Client identifier of the originator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Open key-value map for application use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Message {
    /// Create a new message of the given type, stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: Value::Null,
            topic: None,
            timestamp: Utc::now(),
            id: None,
            priority: Priority::default(),
            ttl: None,
            sender: None,
            metadata: None,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Scope the message to a topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the message id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the time-to-live in seconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the originating client identifier.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Insert a metadata entry, creating the map on first use.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Whether this is a heartbeat frame (`ping`/`pong`/`heartbeat`).
    ///
    /// Heartbeats are liveness probes: they are never dispatched to
    /// handlers and never stored.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        matches!(
            self.kind.as_str(),
            kinds::PING | kinds::PONG | kinds::HEARTBEAT
        )
    }

    /// Synthesize the optimistic local echo of an outbound publish that is
    /// being queued while offline.
    ///
    /// The echo carries a locally-generated id and an `offline` metadata
    /// marker so consumers can distinguish it from a server-confirmed copy.
    #[must_use]
    pub fn local_echo(
        topic: Option<&str>,
        data: Value,
        options: &crate::control::PublishOptions,
        sender: &str,
    ) -> Self {
        let kind = if topic.is_some() {
            kinds::TOPIC_MESSAGE
        } else {
            kinds::BROADCAST
        };

        let mut metadata = options.metadata.clone().unwrap_or_default();
        metadata.insert("offline".to_string(), Value::Bool(true));

        let mut msg = Self::new(kind)
            .with_data(data)
            .with_id(Uuid::new_v4().to_string())
            .with_sender(sender);
        if let Some(t) = topic {
            msg = msg.with_topic(t);
        }
        if let Some(p) = options.priority {
            msg = msg.with_priority(p);
        }
        if let Some(ttl) = options.ttl {
            msg = msg.with_ttl(ttl);
        }
        msg.metadata = Some(metadata);
        msg
    }
}
