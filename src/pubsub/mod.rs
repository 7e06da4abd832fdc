//! Topic-Addressed Publish/Subscribe
//!
//! Fan-out of subscription events keyed by topic string. The [`PubSub`]
//! trait is the seam between resolvers and the event transport:
//!
//! - [`MemoryPubSub`]: single-process reference implementation backed by one
//!   [`Broadcast`] per topic
//! - external-store implementations (Redis and friends) hold one persistent
//!   upstream subscription per topic and fan it out through the same
//!   [`Broadcast`] primitive
//!
//! Delivery is fire-and-forget: subscribers that join after a publish do not
//! see it, and nothing is persisted or replayed.

mod broadcast;
mod memory;

pub use broadcast::{Broadcast, Downstream, DownstreamHandle};
pub use memory::MemoryPubSub;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::stream::EventStream;

/// Capability surface every pub/sub implementation provides
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Deliver `payload` to all current subscribers of `topic`.
    ///
    /// Fire-and-forget: no delivery guarantee to late joiners, no replay.
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PubSubError>;

    /// Subscribe to `topic`, returning a fresh per-caller stream.
    ///
    /// The topic's fan-out is created lazily on first subscribe and shared by
    /// concurrent subscribers.
    async fn subscribe(&self, topic: &str) -> Result<EventStream<Value>, PubSubError>;

    /// Terminate all current subscribers of `topic` and drop its registry
    /// entry. The next subscribe recreates the topic from scratch.
    async fn close(&self, topic: &str) -> Result<(), PubSubError>;
}

/// Errors from a pub/sub backend
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The backing store rejected the operation
    #[error("pub/sub backend error: {0}")]
    Backend(String),

    /// Payload could not be encoded for the backing store
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}
