//! Delivery record: metadata + payload.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::{Delivery, DeliveryState};
use crate::domain::MessageId;

/// Single source of truth for a delivery. Ready/scheduled structures hold
/// message ids only; every state transition happens here.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    pub delivery: Delivery,
    pub state: DeliveryState,

    /// Deliveries made so far, including the current one while Running.
    pub attempts: u32,

    pub last_error: Option<String>,

    /// When a Scheduled/RetryScheduled delivery becomes ready.
    pub next_run_at: Option<Instant>,

    pub created_at: Instant,
    pub updated_at: Instant,
}

impl DeliveryRecord {
    pub fn new(message_id: MessageId, delivery: Delivery) -> Self {
        let now = Instant::now();
        Self {
            message_id,
            delivery,
            state: DeliveryState::Queued,
            attempts: 0,
            last_error: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn delayed(message_id: MessageId, delivery: Delivery, run_at: Instant) -> Self {
        let mut record = Self::new(message_id, delivery);
        record.state = DeliveryState::Scheduled;
        record.next_run_at = Some(run_at);
        record
    }

    pub fn start_attempt(&mut self) {
        self.state = DeliveryState::Running;
        self.attempts += 1;
        self.updated_at = Instant::now();
    }

    pub fn mark_succeeded(&mut self) {
        self.state = DeliveryState::Succeeded;
        self.updated_at = Instant::now();
    }

    pub fn mark_dead(&mut self, error: String) {
        self.state = DeliveryState::Dead;
        self.last_error = Some(error);
        self.updated_at = Instant::now();
    }

    /// The next delivery carries the invocation with one more retry.
    pub fn schedule_retry(&mut self, next_run_at: Instant, error: String, now: DateTime<Utc>) {
        self.delivery.invocation = self.delivery.invocation.requeued(now);
        self.state = DeliveryState::RetryScheduled;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error);
        self.updated_at = Instant::now();
    }

    /// Scheduled/RetryScheduled back to Queued.
    pub fn requeue(&mut self) {
        self.state = DeliveryState::Queued;
        self.next_run_at = None;
        self.updated_at = Instant::now();
    }
}
