//! RefundLedger port.
//!
//! The only part of billing this crate touches. Refunds are keyed by the
//! debit id of the original charge; the ledger makes them idempotent.

use async_trait::async_trait;

use crate::domain::DebitId;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded,
    AlreadyRefunded,
}

#[async_trait]
pub trait RefundLedger: Send + Sync {
    async fn refund(&self, debit_id: &DebitId, reason: &str) -> Result<RefundOutcome, StoreError>;
}
