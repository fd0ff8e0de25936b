//! Event Publisher: writes channel events to the bus and the log.
//!
//! Token events are not written one by one. They accumulate per channel and
//! are flushed as a single `token_batch` when either the debounce timer
//! fires or the batch reaches `max_batch_tokens`. Any other event first
//! flushes the channel's pending batch so order is preserved, then is
//! written verbatim. Terminal events also bound the log's retention.

mod batcher;

pub use batcher::BatchRegistry;

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::PublisherConfig;
use crate::domain::{ChannelKey, Event, EventBody, StreamEntry};
use crate::error::StoreError;
use crate::ports::{Clock, EventBus, EventLog};
use batcher::{ChannelLane, TakenBatch};

struct Inner {
    log: Arc<dyn EventLog>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: PublisherConfig,
    development: bool,
    batches: BatchRegistry,
}

/// Cheap to clone; clones share the batch registry.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

/// What happened to a published event.
#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    /// Written to the log (and bus) as this entry.
    Written(StreamEntry),
    /// Token buffered into the channel's open batch.
    Buffered,
    /// Debug event dropped outside development.
    Suppressed,
}

impl EventPublisher {
    pub fn new(
        log: Arc<dyn EventLog>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: PublisherConfig,
        development: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                bus,
                clock,
                config,
                development,
                batches: BatchRegistry::new(),
            }),
        }
    }

    pub fn registry(&self) -> &BatchRegistry {
        &self.inner.batches
    }

    pub async fn publish(&self, channel: &ChannelKey, event: Event) -> Result<Published, StoreError> {
        if event.is_debug() && !self.inner.development {
            return Ok(Published::Suppressed);
        }

        if let EventBody::Token { text } = &event.body {
            return self.buffer_token(channel, text.clone(), &event).await;
        }

        let terminal = event.is_terminal();
        let lane = self.inner.batches.lane(channel);
        let entry = {
            let _write = lane.write.lock().await;
            let pending = lane.pending.lock().take();
            if let Some(batch) = pending {
                self.write_batch(channel, batch).await?;
            }
            self.write(channel, &event).await?
        };

        if terminal {
            self.finalize(channel).await;
        }
        Ok(Published::Written(entry))
    }

    /// Flush the channel's open batch now, if any.
    pub async fn flush(&self, channel: &ChannelKey) -> Result<Option<StreamEntry>, StoreError> {
        let Some(lane) = self.inner.batches.existing(channel) else {
            return Ok(None);
        };
        let _write = lane.write.lock().await;
        let pending = lane.pending.lock().take();
        match pending {
            Some(batch) => self.write_batch(channel, batch).await.map(Some),
            None => Ok(None),
        }
    }

    async fn buffer_token(
        &self,
        channel: &ChannelKey,
        text: String,
        event: &Event,
    ) -> Result<Published, StoreError> {
        let lane = self.inner.batches.lane(channel);
        let pushed = lane
            .pending
            .lock()
            .push(text, event, self.inner.clock.now());

        if pushed.len >= self.inner.config.max_batch_tokens {
            let _write = lane.write.lock().await;
            // Another flush may have taken the batch while we waited.
            let pending = lane.pending.lock().take();
            if let Some(batch) = pending {
                self.write_batch(channel, batch).await?;
            }
        } else if let Some(generation) = pushed.opened {
            self.arm_timer(channel, &lane, generation);
        }
        Ok(Published::Buffered)
    }

    fn arm_timer(&self, channel: &ChannelKey, lane: &Arc<ChannelLane>, generation: u64) {
        let publisher = self.clone();
        let channel = channel.clone();
        let timer_lane = Arc::clone(lane);
        let debounce = self.inner.config.debounce();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _write = timer_lane.write.lock().await;
            let pending = timer_lane.pending.lock().take_for_timer(generation);
            if let Some(batch) = pending
                && let Err(err) = publisher.write_batch(&channel, batch).await
            {
                error!(%channel, error = %err, "debounced token flush failed");
            }
        });
        lane.pending.lock().set_timer(generation, handle);
    }

    async fn write_batch(&self, channel: &ChannelKey, batch: TakenBatch) -> Result<StreamEntry, StoreError> {
        let event = batch.into_event();
        debug!(%channel, "flushing token batch");
        self.write(channel, &event).await
    }

    /// One bus message and one log append. Bus delivery is best-effort.
    async fn write(&self, channel: &ChannelKey, event: &Event) -> Result<StreamEntry, StoreError> {
        if let Err(err) = self.inner.bus.publish(channel, event).await {
            warn!(%channel, kind = event.body.kind(), error = %err, "bus publish failed");
        }
        self.inner.log.append(channel, event).await
    }

    async fn finalize(&self, channel: &ChannelKey) {
        let config = &self.inner.config;
        if let Err(err) = self.inner.log.expire(channel, config.terminal_ttl()).await {
            warn!(%channel, error = %err, "failed to set stream retention");
        }
        if let Err(err) = self.inner.log.trim(channel, config.max_log_len).await {
            warn!(%channel, error = %err, "failed to trim stream");
        }
        self.inner.batches.release(channel);
    }
}
