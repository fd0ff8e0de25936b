//! EventLog and EventBus ports.
//!
//! The log is the durable replay buffer a stream reads from; the bus is the
//! fire-and-forget fan-out for listeners that are connected right now.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{ChannelKey, Event, StreamEntry, StreamId};
use crate::error::StoreError;

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append and return the stored entry. Ids strictly increase per channel.
    async fn append(&self, channel: &ChannelKey, event: &Event) -> Result<StreamEntry, StoreError>;

    /// Entries with id strictly greater than `after` (all entries when
    /// `None`), oldest first, at most `limit`.
    async fn read_after(
        &self,
        channel: &ChannelKey,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    async fn latest(&self, channel: &ChannelKey) -> Result<Option<StreamEntry>, StoreError>;

    /// Expire the whole channel after `ttl`.
    async fn expire(&self, channel: &ChannelKey, ttl: Duration) -> Result<(), StoreError>;

    /// Keep only the newest `max_len` entries.
    async fn trim(&self, channel: &ChannelKey, max_len: usize) -> Result<(), StoreError>;

    async fn len(&self, channel: &ChannelKey) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Returns the number of live subscribers that received the event.
    async fn publish(&self, channel: &ChannelKey, event: &Event) -> Result<usize, StoreError>;

    fn subscribe(&self, channel: &ChannelKey) -> broadcast::Receiver<Event>;
}
