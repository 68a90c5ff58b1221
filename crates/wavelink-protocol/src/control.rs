//! Control-plane request and response types.
//!
//! The stream itself is one-way; subscribe/unsubscribe/publish/ping calls go
//! out as JSON POSTs against the control plane. Every endpoint answers with
//! the same `{success, message?}` envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{Message, Priority};

/// Control-plane endpoint paths, relative to the control base URL.
pub mod paths {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const SUBSCRIBE_BATCH: &str = "subscribe-batch";
    pub const PUBLISH: &str = "publish";
    pub const PUBLISH_MULTI: &str = "publish-multi";
    pub const BROADCAST: &str = "broadcast";
    pub const PING: &str = "ping";
}

/// The `{success, message?}` envelope every control endpoint returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlResponse {
    /// A successful response.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    /// A failed response with a reason.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Delivery options attached to an outbound publish or broadcast.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl PublishOptions {
    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the time-to-live in seconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Insert a metadata entry.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// Body of a `subscribe` / `unsubscribe` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
    pub client_id: String,
    pub topic: String,
}

/// Body of a `subscribe-batch` call issued after every (re)connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicBatchRequest {
    pub client_id: String,
    pub topics: Vec<String>,
}

/// Body of a `publish` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub topic: String,
    pub message: Message,
}

/// Body of a `publish-multi` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishMultiRequest {
    pub topics: Vec<String>,
    pub message: Message,
}

/// Body of a `broadcast` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub message: Message,
}

/// Body of a heartbeat `ping` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub client_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
