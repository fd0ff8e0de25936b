//! Per-channel token batch registry.
//!
//! The registry is owned by one `EventPublisher`; there is no process-global
//! batch state. Each channel gets a lane holding the pending fragments and
//! the write lock that serialises appends for that channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::domain::{ChannelKey, Event, EventBody, TaskId};

/// Fragments accumulated since the last flush.
#[derive(Debug, Default)]
pub(crate) struct PendingBatch {
    fragments: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    task_id: Option<TaskId>,
    request_id: Option<String>,
    /// Bumped whenever a new batch opens. Timers remember the generation
    /// they were armed for.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Result of buffering one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pushed {
    /// Set when this fragment opened a new batch; arm a timer for it.
    pub opened: Option<u64>,
    pub len: usize,
}

/// A flushed batch, ready to be written as one `token_batch` event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TakenBatch {
    pub fragments: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    pub request_id: Option<String>,
}

impl TakenBatch {
    pub fn into_event(self) -> Event {
        let count = self.fragments.len();
        Event {
            body: EventBody::TokenBatch {
                text: self.fragments.concat(),
                count,
                started_at: self.started_at,
                ended_at: self.ended_at,
            },
            task_id: self.task_id,
            request_id: self.request_id,
            trace_id: None,
        }
    }
}

impl PendingBatch {
    pub fn push(&mut self, text: String, event: &Event, now: DateTime<Utc>) -> Pushed {
        let opened = if self.fragments.is_empty() {
            self.generation += 1;
            self.started_at = Some(now);
            self.task_id = event.task_id.clone();
            self.request_id = event.request_id.clone();
            Some(self.generation)
        } else {
            None
        };
        self.fragments.push(text);
        self.ended_at = Some(now);
        Pushed {
            opened,
            len: self.fragments.len(),
        }
    }

    /// Read-then-clear. Cancels the pending timer unless it is the caller.
    pub fn take(&mut self) -> Option<TakenBatch> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.take_inner()
    }

    /// Take on behalf of the timer armed for `generation`. A stale timer
    /// (its batch was already flushed) gets nothing.
    pub fn take_for_timer(&mut self, generation: u64) -> Option<TakenBatch> {
        if generation != self.generation {
            return None;
        }
        self.timer = None;
        self.take_inner()
    }

    fn take_inner(&mut self) -> Option<TakenBatch> {
        if self.fragments.is_empty() {
            return None;
        }
        let now = self.ended_at.unwrap_or_else(Utc::now);
        Some(TakenBatch {
            fragments: std::mem::take(&mut self.fragments),
            started_at: self.started_at.take().unwrap_or(now),
            ended_at: self.ended_at.take().unwrap_or(now),
            task_id: self.task_id.take(),
            request_id: self.request_id.take(),
        })
    }

    /// Store the timer handle if its batch is still the open one.
    pub fn set_timer(&mut self, generation: u64, timer: JoinHandle<()>) {
        if generation == self.generation && !self.fragments.is_empty() {
            self.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Per-channel state: pending fragments plus the single-writer lane.
#[derive(Debug, Default)]
pub(crate) struct ChannelLane {
    pub pending: Mutex<PendingBatch>,
    pub write: tokio::sync::Mutex<()>,
}

#[derive(Debug, Default)]
pub struct BatchRegistry {
    lanes: Mutex<HashMap<ChannelKey, Arc<ChannelLane>>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lane(&self, channel: &ChannelKey) -> Arc<ChannelLane> {
        Arc::clone(self.lanes.lock().entry(channel.clone()).or_default())
    }

    pub(crate) fn existing(&self, channel: &ChannelKey) -> Option<Arc<ChannelLane>> {
        self.lanes.lock().get(channel).cloned()
    }

    /// Forget a channel whose stream has ended, unless new fragments arrived.
    pub(crate) fn release(&self, channel: &ChannelKey) {
        let mut lanes = self.lanes.lock();
        if lanes.get(channel).is_some_and(|lane| lane.pending.lock().is_empty()) {
            lanes.remove(channel);
        }
    }

    pub fn channels(&self) -> usize {
        self.lanes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str) -> Event {
        Event::for_task(TaskId::new("vision-1"), EventBody::Token { text: text.into() })
    }

    #[test]
    fn first_push_opens_a_generation() {
        let mut batch = PendingBatch::default();
        let now = Utc::now();

        let first = batch.push("a".into(), &token("a"), now);
        let second = batch.push("b".into(), &token("b"), now);

        assert_eq!(first, Pushed { opened: Some(1), len: 1 });
        assert_eq!(second, Pushed { opened: None, len: 2 });
    }

    #[test]
    fn take_concatenates_in_order_and_clears() {
        let mut batch = PendingBatch::default();
        let now = Utc::now();
        for t in ["he", "ll", "o"] {
            batch.push(t.into(), &token(t), now);
        }

        let event = batch.take().unwrap().into_event();

        assert!(matches!(
            event.body,
            EventBody::TokenBatch { ref text, count: 3, .. } if text == "hello"
        ));
        assert_eq!(event.task_id, Some(TaskId::new("vision-1")));
        assert!(batch.is_empty());
        assert!(batch.take().is_none());
    }

    #[test]
    fn stale_timer_gets_nothing() {
        let mut batch = PendingBatch::default();
        let now = Utc::now();
        batch.push("a".into(), &token("a"), now);
        batch.take();
        batch.push("b".into(), &token("b"), now);

        assert!(batch.take_for_timer(1).is_none());
        assert!(batch.take_for_timer(2).is_some());
    }
}
