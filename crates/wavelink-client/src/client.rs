//! The public client facade.
//!
//! [`StreamClient`] is explicitly constructed and explicitly owned; create
//! one per process and hand references to consumers. All connection-state
//! mutation happens on the background actor; the facade only sends commands
//! and reads snapshots.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;
use wavelink_core::{
    ArchiveKey, ArchiveStore, CacheStore, CachedMessage, ConnectionHistoryEntry, FilterGuard,
    HandlerGuard, MessageRouter, OfflineQueue, StatsCollector, StatsSnapshot, Storage,
};
use wavelink_protocol::{Message, PublishOptions};

use crate::config::ClientConfig;
use crate::connection::{
    Command, ConnectionActor, ConnectionState, ConnectionStatus, PublishOutcome, PublishTarget,
};
use crate::control::{ControlPlane, HttpControlPlane};
use crate::registry::SubscriptionRegistry;
use crate::transport::{StreamTransport, WebSocketTransport};

/// Client errors surfaced by the facade.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The background actor is gone; the client was disposed.
    #[error("Client has been disposed")]
    Disposed,

    /// Construction failed.
    #[error("Client setup failed: {0}")]
    Setup(String),
}

/// Builder for [`StreamClient`], allowing the transport, control plane,
/// storage backend, and network signal to be injected.
pub struct StreamClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn StreamTransport>>,
    control: Option<Arc<dyn ControlPlane>>,
    storage: Option<Arc<dyn Storage>>,
    network: Option<watch::Receiver<bool>>,
}

impl StreamClientBuilder {
    /// Override the stream transport (defaults to WebSocket).
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override the control plane (defaults to HTTP).
    #[must_use]
    pub fn control_plane(mut self, control: Arc<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    /// Override the cache storage backend.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Inject a network-availability signal. Without one the network is
    /// assumed up.
    #[must_use]
    pub fn network_watch(mut self, network: watch::Receiver<bool>) -> Self {
        self.network = Some(network);
        self
    }

    /// Assemble the client and spawn its background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if a default component cannot be built.
    pub fn build(self) -> Result<StreamClient, ClientError> {
        let config = self.config;
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("wl_{}", Uuid::new_v4().simple()));

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WebSocketTransport::new(
                &config.stream_url,
                config.auth_token.clone(),
            )),
        };
        let control: Arc<dyn ControlPlane> = match self.control {
            Some(control) => control,
            None => Arc::new(
                HttpControlPlane::new(&config.control_url, config.auth_token.clone())
                    .map_err(|e| ClientError::Setup(e.to_string()))?,
            ),
        };
        let storage = match self.storage {
            Some(storage) => storage,
            None => default_storage(&config)?,
        };

        let cache = Arc::new(CacheStore::open(storage, config.cache.to_settings()));
        let archive = Arc::new(ArchiveStore::with_capacity(config.archive.capacity));
        let router = Arc::new(MessageRouter::new(cache.clone(), archive.clone()));
        let stats = Arc::new(StatsCollector::new());
        let registry = SubscriptionRegistry::load(cache.clone());
        let queue = OfflineQueue::with_capacity(config.queue.max_pending);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::initial());
        let net_rx = self.network.unwrap_or_else(always_up);

        let sweep_interval = Duration::from_millis(config.cache.sweep_interval_ms.max(1_000));

        let actor = ConnectionActor {
            config,
            client_id: client_id.clone(),
            transport,
            control,
            router: router.clone(),
            stats: stats.clone(),
            registry,
            queue,
            cmd_rx,
            status_tx,
            net_rx: net_rx.clone(),
            state: ConnectionState::Disconnected,
            generation: 0,
            attempts: 0,
            connect_requested: false,
            backoff_deadline: None,
            net_watch_live: true,
            shutdown: false,
        };
        let actor_handle = tokio::spawn(actor.run());

        let sweep_cache = cache.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep_cache.sweep_expired();
            }
        });

        Ok(StreamClient {
            client_id,
            cmd_tx,
            status_rx,
            net_rx,
            router,
            cache,
            archive,
            stats,
            actor: actor_handle,
            sweeper,
        })
    }
}

fn default_storage(config: &ClientConfig) -> Result<Arc<dyn Storage>, ClientError> {
    #[cfg(feature = "sled-storage")]
    if let Some(path) = &config.cache.path {
        let storage = wavelink_core::SledStorage::open(path)
            .map_err(|e| ClientError::Setup(e.to_string()))?;
        return Ok(Arc::new(storage));
    }
    #[cfg(not(feature = "sled-storage"))]
    if config.cache.path.is_some() {
        return Err(ClientError::Setup(
            "cache.path requires the sled-storage feature".to_string(),
        ));
    }
    Ok(Arc::new(wavelink_core::MemoryStorage::new()))
}

/// A watch that reports the network as always up, used when no signal is
/// injected. The sender is dropped immediately; the actor detects that and
/// stops polling the channel.
fn always_up() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(true);
    rx
}

/// The resilient server-push stream client.
///
/// One instance per process; see the crate docs for the lifecycle.
pub struct StreamClient {
    client_id: String,
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    net_rx: watch::Receiver<bool>,
    router: Arc<MessageRouter>,
    cache: Arc<CacheStore>,
    archive: Arc<ArchiveStore>,
    stats: Arc<StatsCollector>,
    actor: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl StreamClient {
    /// Start building a client.
    #[must_use]
    pub fn builder(config: ClientConfig) -> StreamClientBuilder {
        StreamClientBuilder {
            config,
            transport: None,
            control: None,
            storage: None,
            network: None,
        }
    }

    /// Build a client with the production transport, control plane, and
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns an error if construction fails.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::builder(config).build()
    }

    /// This client's identifier, as carried in the stream URL.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Open the stream. A no-op while already connecting or connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect).await
    }

    /// Close the stream and cancel any pending reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Disconnect).await
    }

    /// Subscribe to a topic. Idempotent; works offline (the topic is
    /// replayed on the next connect).
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn subscribe_topic(&self, topic: impl Into<String>) -> Result<bool, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            topic: topic.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Disposed)
    }

    /// Unsubscribe from a topic. Removes it locally regardless of
    /// connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn unsubscribe_topic(&self, topic: impl Into<String>) -> Result<bool, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            topic: topic.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Disposed)
    }

    /// Broadcast to every connected client, or queue when offline.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn broadcast(
        &self,
        data: serde_json::Value,
        options: PublishOptions,
    ) -> Result<PublishOutcome, ClientError> {
        self.publish(PublishTarget::Broadcast, data, options).await
    }

    /// Publish to one topic, or queue when offline.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn publish_to_topic(
        &self,
        topic: impl Into<String>,
        data: serde_json::Value,
        options: PublishOptions,
    ) -> Result<PublishOutcome, ClientError> {
        self.publish(PublishTarget::Topic(topic.into()), data, options)
            .await
    }

    /// Publish to several topics, or queue (one entry per topic) when
    /// offline.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn publish_to_topics(
        &self,
        topics: Vec<String>,
        data: serde_json::Value,
        options: PublishOptions,
    ) -> Result<PublishOutcome, ClientError> {
        self.publish(PublishTarget::Topics(topics), data, options)
            .await
    }

    async fn publish(
        &self,
        target: PublishTarget,
        data: serde_json::Value,
        options: PublishOptions,
    ) -> Result<PublishOutcome, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish {
            target,
            data,
            options,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Disposed)
    }

    /// The current subscription set.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has been disposed.
    pub async fn topics(&self) -> Result<Vec<String>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Topics { reply }).await?;
        rx.await.map_err(|_| ClientError::Disposed)
    }

    /// Register a message handler. The key is `"message"` for all messages,
    /// `"topic:<name>"`, `"priority:<level>"`, or an exact message type.
    /// Dropping the guard unregisters.
    #[must_use]
    pub fn on(
        &self,
        key: &str,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> HandlerGuard {
        self.router.register(key, handler)
    }

    /// Register a named delivery filter; any failing filter suppresses
    /// handler dispatch (never storage).
    #[must_use]
    pub fn on_filter(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> FilterGuard {
        self.router.register_filter(name, predicate)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    /// Current connection status snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch connection-status transitions.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Whether the network is up and the stream connected.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.net_rx.borrow() && self.state() == ConnectionState::Connected
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.archive)
    }

    /// The connection history log, oldest first.
    #[must_use]
    pub fn connection_history(&self) -> Vec<ConnectionHistoryEntry> {
        self.stats.history()
    }

    /// Archived messages under a key (`"global"`, `"topic:<name>"`, or
    /// `"kind:<name>"`), most recent first. An unknown key yields nothing.
    #[must_use]
    pub fn archived_messages(&self, key: &str) -> Vec<Message> {
        match ArchiveKey::parse(key) {
            Some(key) => self.archive.get(&key),
            None => {
                debug!(key = %key, "Unknown archive key");
                Vec::new()
            }
        }
    }

    /// Cached messages, most recent first.
    #[must_use]
    pub fn cached_messages(&self) -> Vec<CachedMessage> {
        self.cache.messages()
    }

    /// Cached messages scoped to a topic.
    #[must_use]
    pub fn cached_by_topic(&self, topic: &str) -> Vec<CachedMessage> {
        self.cache.get_by_topic(topic)
    }

    /// Cached messages of a given type.
    #[must_use]
    pub fn cached_by_kind(&self, kind: &str) -> Vec<CachedMessage> {
        self.cache.get_by_kind(kind)
    }

    /// The cache store, for settings updates and clears.
    #[must_use]
    pub fn cache(&self) -> Arc<CacheStore> {
        self.cache.clone()
    }

    /// The archive store.
    #[must_use]
    pub fn archive(&self) -> Arc<ArchiveStore> {
        self.archive.clone()
    }

    /// Shut down the background tasks, closing the stream first.
    pub async fn dispose(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        self.sweeper.abort();
        if tokio::time::timeout(Duration::from_secs(5), &mut self.actor)
            .await
            .is_err()
        {
            self.actor.abort();
        }
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| ClientError::Disposed)
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        // Best-effort shutdown signal.
        let _ = self.cmd_tx.try_send(Command::Shutdown);
        self.sweeper.abort();
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}
