//! Control-plane boundary.
//!
//! Subscribe, publish, and heartbeat calls go out as JSON POSTs; the trait
//! keeps the connection machinery independent of HTTP so tests can script
//! responses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use wavelink_protocol::control::{
    paths, BroadcastRequest, PingRequest, PublishMultiRequest, PublishRequest, TopicBatchRequest,
    TopicRequest,
};
use wavelink_protocol::{ControlResponse, Message};

/// Default timeout for a single control-plane request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Control-plane errors.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The request could not be sent or the response not read.
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The control plane answered with a non-success HTTP status.
    #[error("Control plane returned HTTP {0}")]
    Status(reqwest::StatusCode),
}

/// The control plane the client publishes and subscribes through.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Subscribe `client_id` to a topic.
    async fn subscribe(&self, client_id: &str, topic: &str)
        -> Result<ControlResponse, ControlError>;

    /// Unsubscribe `client_id` from a topic.
    async fn unsubscribe(
        &self,
        client_id: &str,
        topic: &str,
    ) -> Result<ControlResponse, ControlError>;

    /// Subscribe `client_id` to a whole set of topics in one call.
    async fn subscribe_batch(
        &self,
        client_id: &str,
        topics: &[String],
    ) -> Result<ControlResponse, ControlError>;

    /// Publish a message to one topic.
    async fn publish(&self, topic: &str, message: &Message)
        -> Result<ControlResponse, ControlError>;

    /// Publish a message to several topics.
    async fn publish_multi(
        &self,
        topics: &[String],
        message: &Message,
    ) -> Result<ControlResponse, ControlError>;

    /// Broadcast a message to every connected client.
    async fn broadcast(&self, message: &Message) -> Result<ControlResponse, ControlError>;

    /// Heartbeat ping; the matching pong arrives as a stream frame.
    async fn ping(
        &self,
        client_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ControlResponse, ControlError>;
}

/// HTTP control plane.
pub struct HttpControlPlane {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpControlPlane {
    /// Create a control plane rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            auth_token,
        })
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ControlResponse, ControlError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ControlError::Status(response.status()));
        }
        Ok(response.json::<ControlResponse>().await?)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn subscribe(
        &self,
        client_id: &str,
        topic: &str,
    ) -> Result<ControlResponse, ControlError> {
        self.post(
            paths::SUBSCRIBE,
            &TopicRequest {
                client_id: client_id.to_string(),
                topic: topic.to_string(),
            },
        )
        .await
    }

    async fn unsubscribe(
        &self,
        client_id: &str,
        topic: &str,
    ) -> Result<ControlResponse, ControlError> {
        self.post(
            paths::UNSUBSCRIBE,
            &TopicRequest {
                client_id: client_id.to_string(),
                topic: topic.to_string(),
            },
        )
        .await
    }

    async fn subscribe_batch(
        &self,
        client_id: &str,
        topics: &[String],
    ) -> Result<ControlResponse, ControlError> {
        self.post(
            paths::SUBSCRIBE_BATCH,
            &TopicBatchRequest {
                client_id: client_id.to_string(),
                topics: topics.to_vec(),
            },
        )
        .await
    }

    async fn publish(
        &self,
        topic: &str,
        message: &Message,
    ) -> Result<ControlResponse, ControlError> {
        self.post(
            paths::PUBLISH,
            &PublishRequest {
                topic: topic.to_string(),
                message: message.clone(),
            },
        )
        .await
    }

    async fn publish_multi(
        &self,
        topics: &[String],
        message: &Message,
    ) -> Result<ControlResponse, ControlError> {
        self.post(
            paths::PUBLISH_MULTI,
            &PublishMultiRequest {
                topics: topics.to_vec(),
                message: message.clone(),
            },
        )
        .await
    }

    async fn broadcast(&self, message: &Message) -> Result<ControlResponse, ControlError> {
        self.post(
            paths::BROADCAST,
            &BroadcastRequest {
                message: message.clone(),
            },
        )
        .await
    }

    async fn ping(
        &self,
        client_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ControlResponse, ControlError> {
        self.post(
            paths::PING,
            &PingRequest {
                client_id: client_id.to_string(),
                timestamp,
            },
        )
        .await
    }
}

impl std::fmt::Debug for HttpControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControlPlane")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.auth_token.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let control = HttpControlPlane::new("http://push.local/api/", None).unwrap();
        assert_eq!(control.base_url, "http://push.local/api");

        let control = HttpControlPlane::new("http://push.local/api", None).unwrap();
        assert_eq!(control.base_url, "http://push.local/api");
    }
}
