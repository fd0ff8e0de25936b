//! In-memory task queue.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Delivery, DeliveryLease, DeliveryRecord, DeliveryState, EnqueueOptions, QueueError,
    RetryPolicy, TaskQueue,
};
use crate::domain::MessageId;
use crate::observability::QueueCounts;
use crate::ports::{Clock, IdGenerator, SystemClock};

/// Finished records kept when no retention is configured.
const DEFAULT_RETAIN_FINISHED: usize = 1000;

/// Scheduled entry for the delay heap.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledDelivery {
    next_run_at: Instant,
    message_id: MessageId,
}

impl PartialOrd for ScheduledDelivery {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledDelivery {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .next_run_at
            .cmp(&self.next_run_at)
            .then_with(|| other.message_id.cmp(&self.message_id))
    }
}

struct QueueState {
    records: HashMap<MessageId, DeliveryRecord>,
    ready: VecDeque<MessageId>,
    scheduled: BinaryHeap<ScheduledDelivery>,
    /// Succeeded/Dead records, oldest first.
    finished: VecDeque<MessageId>,
    retain_finished: usize,
    retry_policy: RetryPolicy,
    closed: bool,
}

impl QueueState {
    fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            records: HashMap::new(),
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            finished: VecDeque::new(),
            retain_finished: DEFAULT_RETAIN_FINISHED,
            retry_policy,
            closed: false,
        }
    }

    /// Remember a record that reached Succeeded/Dead and drop the oldest
    /// finished records beyond the retention count.
    fn finish(&mut self, message_id: MessageId) {
        self.finished.push_back(message_id);
        while self.finished.len() > self.retain_finished {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if self.records.remove(&oldest).is_some() {
                debug!(message_id = %oldest, "finished delivery pruned");
            }
        }
    }

    /// Move deliveries whose time has come from the heap to the ready queue.
    fn promote_scheduled(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_run_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&entry.message_id)
                && record.state.is_waiting()
            {
                record.requeue();
                self.ready.push_back(entry.message_id);
            }
        }
    }

    fn schedule(&mut self, message_id: MessageId, next_run_at: Instant) {
        self.scheduled.push(ScheduledDelivery {
            next_run_at,
            message_id,
        });
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.state {
                DeliveryState::Queued => counts.queued += 1,
                DeliveryState::Scheduled => counts.scheduled += 1,
                DeliveryState::Running => counts.running += 1,
                DeliveryState::Succeeded => counts.succeeded += 1,
                DeliveryState::RetryScheduled => counts.retry_scheduled += 1,
                DeliveryState::Dead => counts.dead += 1,
            }
        }
        counts
    }
}

pub struct InMemoryTaskQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskQueue {
    pub fn new(retry_policy: RetryPolicy, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::new(retry_policy))),
            notify: Arc::new(Notify::new()),
            ids,
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock that stamps `enqueuedAt` on redeliveries.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keep at most `count` succeeded/dead records. Set before the queue is
    /// shared.
    pub fn with_retention(mut self, count: usize) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.get_mut().retain_finished = count;
        }
        self
    }

    /// Stop handing out leases. Waiting `lease` calls return `None`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn record(&self, message_id: MessageId) -> Option<DeliveryRecord> {
        self.state.lock().await.records.get(&message_id).cloned()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        delivery: Delivery,
        options: EnqueueOptions,
    ) -> Result<MessageId, QueueError> {
        let message_id = self.ids.generate_message_id();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            match options.delay.filter(|d| !d.is_zero()) {
                Some(delay) => {
                    let run_at = Instant::now() + delay;
                    state
                        .records
                        .insert(message_id, DeliveryRecord::delayed(message_id, delivery, run_at));
                    state.schedule(message_id, run_at);
                }
                None => {
                    state
                        .records
                        .insert(message_id, DeliveryRecord::new(message_id, delivery));
                    state.ready.push_back(message_id);
                }
            }
        }

        // Notify outside the lock
        self.notify.notify_one();
        Ok(message_id)
    }

    async fn lease(&self) -> Option<Box<dyn DeliveryLease>> {
        loop {
            // Register interest before checking state so a notify between the
            // check and the wait is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                state.promote_scheduled();

                while let Some(message_id) = state.ready.pop_front() {
                    let retry_policy = state.retry_policy.clone();
                    let Some(record) = state.records.get_mut(&message_id) else {
                        continue;
                    };
                    record.start_attempt();
                    return Some(Box::new(InMemoryLease {
                        message_id,
                        delivery: record.delivery.clone(),
                        attempt: record.attempts,
                        queue: Arc::clone(&self.state),
                        retry_policy,
                        notify: Arc::clone(&self.notify),
                        clock: Arc::clone(&self.clock),
                    }));
                }

                state.scheduled.peek().map(|entry| entry.next_run_at)
            };

            match next_wake {
                Some(wake_time) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(wake_time) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(self.state.lock().await.counts())
    }
}

struct InMemoryLease {
    message_id: MessageId,
    delivery: Delivery,
    attempt: u32,
    queue: Arc<Mutex<QueueState>>,
    retry_policy: RetryPolicy,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLease {
    async fn reschedule(&self, delay: Duration, error: String, refund_attempt: bool) -> Result<(), QueueError> {
        {
            let mut state = self.queue.lock().await;
            let record = state
                .records
                .get_mut(&self.message_id)
                .ok_or(QueueError::NotFound(self.message_id))?;
            if refund_attempt {
                record.attempts = record.attempts.saturating_sub(1);
            }
            let next_run_at = Instant::now() + delay;
            record.schedule_retry(next_run_at, error, self.clock.now());
            state.schedule(self.message_id, next_run_at);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn mark_dead(&self, error: String) -> Result<(), QueueError> {
        let mut state = self.queue.lock().await;
        let record = state
            .records
            .get_mut(&self.message_id)
            .ok_or(QueueError::NotFound(self.message_id))?;
        record.mark_dead(error);
        state.finish(self.message_id);
        Ok(())
    }
}

#[async_trait]
impl DeliveryLease for InMemoryLease {
    fn message_id(&self) -> MessageId {
        self.message_id
    }

    fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut state = self.queue.lock().await;
        let record = state
            .records
            .get_mut(&self.message_id)
            .ok_or(QueueError::NotFound(self.message_id))?;
        record.mark_succeeded();
        state.finish(self.message_id);
        Ok(())
    }

    async fn retry_after(self: Box<Self>, delay: Duration, reason: String) -> Result<(), QueueError> {
        debug!(message_id = %self.message_id, ?delay, %reason, "delivery throttled");
        self.reschedule(delay, reason, true).await
    }

    async fn fail(self: Box<Self>, error: String) -> Result<(), QueueError> {
        if self.retry_policy.exhausted(self.attempt) {
            warn!(
                message_id = %self.message_id,
                attempts = self.attempt,
                max_attempts = self.retry_policy.max_attempts,
                %error,
                "delivery dead after max attempts"
            );
            return self.mark_dead(error).await;
        }
        let delay = self.retry_policy.next_delay(self.attempt);
        debug!(message_id = %self.message_id, attempt = self.attempt, ?delay, %error, "delivery retry scheduled");
        self.reschedule(delay, error, false).await
    }

    async fn reject(self: Box<Self>, error: String) -> Result<(), QueueError> {
        warn!(message_id = %self.message_id, %error, "delivery rejected by target");
        self.mark_dead(error).await
    }
}
