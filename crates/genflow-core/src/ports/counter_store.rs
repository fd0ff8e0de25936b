//! CounterStore port.
//!
//! Atomic counters and locks with TTL. Admission limits, idempotency records
//! and worker guards are all expressed on top of these few primitives, so a
//! single shared store (Redis in production) coordinates every process.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Result of a bounded increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedIncr {
    /// Counter incremented; `value` is the new count.
    Acquired { value: u64 },
    /// Counter left unchanged because it is already at `max`.
    AtCapacity { value: u64, retry_after: Duration },
}

impl BoundedIncr {
    pub fn is_acquired(&self) -> bool {
        matches!(self, BoundedIncr::Acquired { .. })
    }
}

/// Snapshot of a fixed window after counting one more hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    /// Time until the window resets.
    pub remaining: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Held { holder: String },
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment unless the counter is already at `max`. Refreshes the TTL
    /// on success.
    async fn incr_bounded(
        &self,
        key: &str,
        max: u64,
        ttl: Duration,
    ) -> Result<BoundedIncr, StoreError>;

    /// Decrement, flooring at zero. Returns the new value.
    async fn decr(&self, key: &str) -> Result<u64, StoreError>;

    /// Current value (0 when absent or expired).
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Count a hit in a fixed window. The TTL is only set when the window opens.
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<WindowCount, StoreError>;

    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockOutcome, StoreError>;

    /// Release only if `holder` still owns the lock. Returns whether it did.
    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, StoreError>;
}
