//! Delivery state machine.

use serde::{Deserialize, Serialize};

/// State transitions:
/// - Queued -> Running -> Succeeded
/// - Scheduled -> Queued (delayed enqueue reaches its time)
/// - Running -> RetryScheduled -> Queued (until max_attempts)
/// - Running -> Dead (max_attempts exceeded, or the target rejected the body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Ready to deliver now.
    Queued,

    /// Enqueued with a delay that has not elapsed yet.
    Scheduled,

    /// Leased by a dispatcher.
    Running,

    Succeeded,

    /// Waiting out a backoff before redelivery.
    RetryScheduled,

    Dead,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Succeeded | DeliveryState::Dead)
    }

    /// States parked in the scheduled heap.
    pub fn is_waiting(self) -> bool {
        matches!(self, DeliveryState::Scheduled | DeliveryState::RetryScheduled)
    }
}
