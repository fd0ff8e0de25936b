//! In-memory event log and bus.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::domain::{ChannelKey, Event, StreamEntry, StreamId};
use crate::error::StoreError;
use crate::ports::{Clock, EventBus, EventLog};

#[derive(Debug, Default)]
struct ChannelLog {
    entries: VecDeque<StreamEntry>,
    last_id: Option<StreamId>,
    expires_at: Option<i64>,
}

impl ChannelLog {
    /// Clock millisecond, or the previous id's millisecond with the next
    /// sequence if the clock has not moved past it.
    fn next_id(&self, now_ms: u64) -> StreamId {
        match self.last_id {
            Some(last) if now_ms <= last.ms => StreamId::new(last.ms, last.seq + 1),
            _ => StreamId::new(now_ms, 0),
        }
    }
}

#[derive(Clone)]
pub struct InMemoryEventLog {
    clock: Arc<dyn Clock>,
    channels: Arc<Mutex<HashMap<ChannelKey, ChannelLog>>>,
    reads: Arc<AtomicUsize>,
}

impl InMemoryEventLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            channels: Arc::new(Mutex::new(HashMap::new())),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total `read_after` calls served, across channels.
    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn drop_if_expired(channels: &mut HashMap<ChannelKey, ChannelLog>, key: &ChannelKey, now: i64) {
        let expired = channels
            .get(key)
            .and_then(|c| c.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            channels.remove(key);
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, channel: &ChannelKey, event: &Event) -> Result<StreamEntry, StoreError> {
        let now = self.clock.now_millis();
        let mut channels = self.channels.lock();
        Self::drop_if_expired(&mut channels, channel, now);

        let log = channels.entry(channel.clone()).or_default();
        let id = log.next_id(now.max(0) as u64);
        let entry = StreamEntry {
            id,
            event: event.clone(),
        };
        log.last_id = Some(id);
        log.entries.push_back(entry.clone());
        Ok(entry)
    }

    async fn read_after(
        &self,
        channel: &ChannelKey,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now_millis();
        let mut channels = self.channels.lock();
        Self::drop_if_expired(&mut channels, channel, now);

        let Some(log) = channels.get(channel) else {
            return Ok(Vec::new());
        };
        Ok(log
            .entries
            .iter()
            .filter(|e| after.is_none_or(|cursor| e.id > cursor))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest(&self, channel: &ChannelKey) -> Result<Option<StreamEntry>, StoreError> {
        let now = self.clock.now_millis();
        let mut channels = self.channels.lock();
        Self::drop_if_expired(&mut channels, channel, now);
        Ok(channels.get(channel).and_then(|c| c.entries.back().cloned()))
    }

    async fn expire(&self, channel: &ChannelKey, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut channels = self.channels.lock();
        if let Some(log) = channels.get_mut(channel) {
            log.expires_at = Some(now + ttl.as_millis() as i64);
        }
        Ok(())
    }

    async fn trim(&self, channel: &ChannelKey, max_len: usize) -> Result<(), StoreError> {
        let mut channels = self.channels.lock();
        if let Some(log) = channels.get_mut(channel) {
            while log.entries.len() > max_len {
                log.entries.pop_front();
            }
        }
        Ok(())
    }

    async fn len(&self, channel: &ChannelKey) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let mut channels = self.channels.lock();
        Self::drop_if_expired(&mut channels, channel, now);
        Ok(channels.get(channel).map_or(0, |c| c.entries.len()))
    }
}

const BUS_CAPACITY: usize = 1024;

#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    senders: Arc<Mutex<HashMap<ChannelKey, broadcast::Sender<Event>>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, channel: &ChannelKey, event: &Event) -> Result<usize, StoreError> {
        let senders = self.senders.lock();
        let Some(sender) = senders.get(channel) else {
            return Ok(0);
        };
        // No receivers is not an error for fire-and-forget delivery.
        Ok(sender.send(event.clone()).unwrap_or(0))
    }

    fn subscribe(&self, channel: &ChannelKey) -> broadcast::Receiver<Event> {
        let mut senders = self.senders.lock();
        senders
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventBody, TaskId};
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};

    fn channel() -> ChannelKey {
        ChannelKey::for_task("svc", "u1", &TaskId::new("t1"))
    }

    fn token(text: &str) -> Event {
        Event::new(EventBody::Token { text: text.into() })
    }

    fn log() -> (InMemoryEventLog, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (InMemoryEventLog::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn ids_increase_within_and_across_milliseconds() {
        let (log, clock) = log();
        let a = log.append(&channel(), &token("a")).await.unwrap();
        let b = log.append(&channel(), &token("b")).await.unwrap();
        clock.advance(Duration::from_millis(1));
        let c = log.append(&channel(), &token("c")).await.unwrap();

        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(b.id.seq, 1);
        assert_eq!(c.id.seq, 0);
    }

    #[tokio::test]
    async fn ids_never_go_backwards_with_the_clock() {
        let (log, clock) = log();
        clock.advance(Duration::from_secs(5));
        let a = log.append(&channel(), &token("a")).await.unwrap();
        clock.set(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let b = log.append(&channel(), &token("b")).await.unwrap();

        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn read_after_is_exclusive() {
        let (log, _) = log();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(log.append(&channel(), &token(&i.to_string())).await.unwrap().id);
        }

        let resumed = log.read_after(&channel(), Some(ids[4]), 100).await.unwrap();

        let got: Vec<StreamId> = resumed.iter().map(|e| e.id).collect();
        assert_eq!(got, ids[5..].to_vec());
    }

    #[tokio::test]
    async fn trim_keeps_newest_and_expire_drops_channel() {
        let (log, clock) = log();
        for i in 0..5 {
            log.append(&channel(), &token(&i.to_string())).await.unwrap();
        }
        log.trim(&channel(), 2).await.unwrap();

        let remaining = log.read_after(&channel(), None, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(matches!(&remaining[1].event.body, EventBody::Token { text } if text == "4"));

        log.expire(&channel(), Duration::from_secs(60)).await.unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(log.len(&channel()).await.unwrap(), 0);
        assert!(log.latest(&channel()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bus_delivers_to_live_subscribers_only() {
        let bus = InMemoryEventBus::new();
        assert_eq!(bus.publish(&channel(), &token("early")).await.unwrap(), 0);

        let mut rx = bus.subscribe(&channel());
        assert_eq!(bus.publish(&channel(), &token("late")).await.unwrap(), 1);

        let got = rx.recv().await.unwrap();
        assert!(matches!(got.body, EventBody::Token { text } if text == "late"));
    }
}
