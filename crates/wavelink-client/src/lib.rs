//! # wavelink-client
//!
//! Resilient server-push stream client: one long-lived upstream connection
//! that survives network loss, re-establishes subscriptions, queues
//! outbound messages while offline, and keeps bounded local cache/archive
//! of everything received.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ commands ┌─────────────────┐ opens ┌───────────────┐
//! │ StreamClient │─────────▶│ ConnectionActor │──────▶│ StreamTransport│
//! └──────┬───────┘  watch   └───────┬─────────┘       └───────────────┘
//!        │ reads                    │ dispatches
//!        ▼                          ▼
//! ┌──────────────┐          ┌───────────────┐  POST   ┌───────────────┐
//! │ Cache/Archive│◀─────────│ MessageRouter │         │ ControlPlane  │
//! └──────────────┘  writes  └───────────────┘         └───────────────┘
//! ```
//!
//! The actor exclusively owns the connection state machine, the
//! subscription set, and the offline queue; everything else is shared,
//! internally-locked read state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wavelink_client::{ClientConfig, StreamClient};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ClientConfig::load()?;
//! let client = StreamClient::new(config)?;
//!
//! let _guard = client.on("topic:alerts", |message| {
//!     println!("alert: {}", message.data);
//! });
//!
//! client.connect().await?;
//! client.subscribe_topic("alerts").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Construct one client per process and pass references to consumers; the
//! client owns its background tasks and stops them on [`StreamClient::dispose`]
//! or drop.

pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod instrument;
pub mod registry;
pub mod transport;

pub use client::{ClientError, StreamClient, StreamClientBuilder};
pub use config::ClientConfig;
pub use connection::{ConnectionState, ConnectionStatus, PublishOutcome, PublishTarget};
pub use control::{ControlError, ControlPlane, HttpControlPlane};
pub use transport::{StreamConnection, StreamTransport, TransportError, WebSocketTransport};

// Re-exports of the data-layer types consumers touch directly.
pub use wavelink_core::{
    ArchiveKey, CacheSettings, CacheUpdate, CachedMessage, ConnectionAction,
    ConnectionHistoryEntry, FilterGuard, HandlerGuard, StatsSnapshot,
};
pub use wavelink_protocol::{Message, Priority, PublishOptions};
