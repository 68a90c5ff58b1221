//! # wavelink-protocol
//!
//! Wire data model for the Wavelink server-push stream client.
//!
//! This crate defines the message format pushed over the upstream event
//! stream, the JSON codec for those frames, and the request/response types
//! of the control plane used for subscribe/publish calls.
//!
//! ## Message anatomy
//!
//! Every frame on the stream is a JSON-encoded [`Message`]:
//!
//! - `type` - discriminator (`"broadcast"`, `"topic_message"`, `"ping"`, ...)
//! - `topic` - optional topic scope
//! - `priority` - `low | normal | high | critical`
//! - `ttl` - optional seconds; `0` means "do not archive/cache"
//!
//! ## Example
//!
//! ```rust
//! use wavelink_protocol::{codec, Message, Priority};
//!
//! let msg = Message::new("topic_message")
//!     .with_topic("alerts")
//!     .with_priority(Priority::High);
//!
//! let encoded = codec::encode_message(&msg).unwrap();
//! let decoded = codec::decode_message(&encoded).unwrap();
//! assert_eq!(decoded.topic.as_deref(), Some("alerts"));
//! ```

pub mod codec;
pub mod control;
pub mod message;

pub use codec::{decode_message, encode_message, ProtocolError};
pub use control::{paths, ControlResponse, PublishOptions};
pub use message::{kinds, Message, Priority};
