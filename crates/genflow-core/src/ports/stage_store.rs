//! StageStore port: the persistence capability the worker writes results to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{StageStatus, TaskId};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub result: Option<serde_json::Value>,
}

#[async_trait]
pub trait StageStore: Send + Sync {
    async fn persist(
        &self,
        stage_id: &TaskId,
        result: Option<serde_json::Value>,
        status: StageStatus,
    ) -> Result<(), StoreError>;

    async fn get(&self, stage_id: &TaskId) -> Result<Option<StageRecord>, StoreError>;

    /// Flip the stage that follows `stage_id` to pending and return its id.
    /// `None` when no follow-up stage is linked.
    async fn advance(&self, stage_id: &TaskId) -> Result<Option<TaskId>, StoreError>;
}
