//! # wavelink-core
//!
//! Network-unaware state for the Wavelink stream client.
//!
//! This crate provides the data layers the connection machinery writes
//! through and the UI reads back:
//!
//! - **CacheStore** - bounded, TTL-expiring persistence of received messages
//! - **ArchiveStore** - in-memory ring buffers of recent messages per keyspace
//! - **MessageRouter** - handler fan-out with filters and write-through
//! - **OfflineQueue** - FIFO of outbound publishes awaiting connectivity
//! - **StatsCollector** - counters, connection history, message rate
//! - **Storage** - byte-store boundary backing the cache
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────────┐     ┌─────────────┐
//! │   Stream    │────▶│ MessageRouter │────▶│  Handlers   │
//! └─────────────┘     └───────┬───────┘     └─────────────┘
//!                             │ write-through
//!                     ┌───────▼───────┐     ┌─────────────┐
//!                     │  CacheStore   │     │ ArchiveStore│
//!                     └───────┬───────┘     └─────────────┘
//!                             ▼
//!                     ┌───────────────┐
//!                     │    Storage    │
//!                     └───────────────┘
//! ```
//!
//! Everything here is synchronous and internally locked; the connection
//! actor and the embedding application may share these stores freely.

pub mod archive;
pub mod cache;
pub mod queue;
pub mod router;
pub mod stats;
pub mod storage;

pub use archive::{ArchiveKey, ArchiveStore};
pub use cache::{CacheSettings, CacheStore, CacheUpdate, CachedMessage};
pub use queue::{OfflineQueue, PendingPublish};
pub use router::{DispatchKey, DispatchOutcome, FilterGuard, HandlerGuard, MessageRouter};
pub use stats::{ConnectionAction, ConnectionHistoryEntry, StatsCollector, StatsSnapshot};
pub use storage::{MemoryStorage, Storage, StorageError};

#[cfg(feature = "sled-storage")]
pub use storage::SledStorage;
