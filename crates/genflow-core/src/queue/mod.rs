//! Task Queue: at-least-once delivery of task invocations to the worker
//! endpoint, with delayed enqueue and retry scheduling.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::InMemoryTaskQueue;
pub use record::DeliveryRecord;
pub use retry::RetryPolicy;
pub use state::DeliveryState;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, TaskInvocation};
use crate::observability::QueueCounts;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("delivery not found: {0}")]
    NotFound(MessageId),
}

/// What the queue delivers: a task body addressed to a worker URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub url: String,
    pub invocation: TaskInvocation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Deliver no earlier than this long from now.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

/// A leased delivery. The holder must settle it exactly once.
///
/// - The queue owns state transitions (Queued -> Running -> ...).
/// - The dispatcher performs the delivery and reports how it went.
#[async_trait]
pub trait DeliveryLease: Send {
    fn message_id(&self) -> MessageId;

    fn delivery(&self) -> &Delivery;

    /// 1-indexed attempt number of this delivery.
    fn attempt(&self) -> u32;

    /// Target accepted the delivery.
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Target asked to be retried later (throttled). Does not consume the
    /// attempt budget.
    async fn retry_after(self: Box<Self>, delay: Duration, reason: String) -> Result<(), QueueError>;

    /// Target failed; the retry policy decides between backoff and dead.
    async fn fail(self: Box<Self>, error: String) -> Result<(), QueueError>;

    /// Target rejected the body outright; never redelivered.
    async fn reject(self: Box<Self>, error: String) -> Result<(), QueueError>;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        delivery: Delivery,
        options: EnqueueOptions,
    ) -> Result<MessageId, QueueError>;

    /// Wait for the next ready delivery. `None` once the queue is closed.
    async fn lease(&self) -> Option<Box<dyn DeliveryLease>>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
