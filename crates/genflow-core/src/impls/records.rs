//! In-memory ledger, stage store, and audit/analytics sinks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::domain::{DebitId, StageStatus, TaskId};
use crate::error::StoreError;
use crate::ports::{
    AnalyticsEvent, AnalyticsSink, AuditRecord, AuditSink, RefundLedger, RefundOutcome,
    StageRecord, StageStore,
};

/// Refund ledger that remembers every debit it refunded.
#[derive(Clone, Default)]
pub struct InMemoryRefundLedger {
    refunded: Arc<Mutex<HashSet<DebitId>>>,
    log: Arc<Mutex<Vec<(DebitId, String)>>>,
}

impl InMemoryRefundLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refunds actually applied, in order, with their reasons.
    pub fn refunds(&self) -> Vec<(DebitId, String)> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl RefundLedger for InMemoryRefundLedger {
    async fn refund(&self, debit_id: &DebitId, reason: &str) -> Result<RefundOutcome, StoreError> {
        if !self.refunded.lock().insert(debit_id.clone()) {
            return Ok(RefundOutcome::AlreadyRefunded);
        }
        self.log.lock().push((debit_id.clone(), reason.to_string()));
        Ok(RefundOutcome::Refunded)
    }
}

/// Stage results keyed by task id, plus links to each stage's successor.
#[derive(Clone, Default)]
pub struct InMemoryStageStore {
    records: Arc<RwLock<HashMap<TaskId, StageRecord>>>,
    next: Arc<RwLock<HashMap<TaskId, TaskId>>>,
}

impl InMemoryStageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `to` runs after `from` completes.
    pub fn link(&self, from: TaskId, to: TaskId) {
        self.next.write().insert(from, to);
    }
}

#[async_trait]
impl StageStore for InMemoryStageStore {
    async fn persist(
        &self,
        stage_id: &TaskId,
        result: Option<serde_json::Value>,
        status: StageStatus,
    ) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(stage_id.clone(), StageRecord { status, result });
        Ok(())
    }

    async fn get(&self, stage_id: &TaskId) -> Result<Option<StageRecord>, StoreError> {
        Ok(self.records.read().get(stage_id).cloned())
    }

    async fn advance(&self, stage_id: &TaskId) -> Result<Option<TaskId>, StoreError> {
        let Some(next) = self.next.read().get(stage_id).cloned() else {
            return Ok(None);
        };
        self.records.write().insert(
            next.clone(),
            StageRecord {
                status: StageStatus::Pending,
                result: None,
            },
        );
        Ok(Some(next))
    }
}

/// Collects audit records and analytics events for inspection.
#[derive(Clone, Default)]
pub struct InMemoryAuditLog {
    records: Arc<Mutex<Vec<AuditRecord>>>,
    events: Arc<Mutex<Vec<AnalyticsEvent>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, record: AuditRecord) -> Result<(), StoreError> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[async_trait]
impl AnalyticsSink for InMemoryAuditLog {
    async fn track(&self, event: AnalyticsEvent) -> Result<(), StoreError> {
        self.events.lock().push(event);
        Ok(())
    }
}
