use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{DebitId, TaskId};
use super::stage::{Tier, UnknownName};

/// How a stage is executed. Also the `{kind}` segment of the worker URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Token-by-token output relayed as it is produced.
    Stream,
    /// One structured response validated against a stage schema.
    Batch,
}

impl ExecutionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionKind::Stream => "stream",
            ExecutionKind::Batch => "batch",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(ExecutionKind::Stream),
            "batch" => Ok(ExecutionKind::Batch),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// One unit of work as it travels from admission through the queue to a worker.
///
/// Immutable once admitted; a requeue produces a copy via [`TaskInvocation::requeued`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInvocation {
    pub task_id: TaskId,
    pub service_id: String,
    pub user_id: String,
    pub locale: String,
    pub template_id: String,
    #[serde(default)]
    pub variables: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub has_quota: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debit_id: Option<DebitId>,
}

impl TaskInvocation {
    pub fn tier(&self) -> Tier {
        Tier::from_quota(self.has_quota)
    }

    /// Copy for redelivery: one more retry, stamped with the requeue time.
    pub fn requeued(&self, now: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            enqueued_at: now,
            ..self.clone()
        }
    }

    /// Caller-supplied variable as a string, if present.
    pub fn variable_str(&self, key: &str) -> Option<&str> {
        self.variables.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> TaskInvocation {
        TaskInvocation {
            task_id: TaskId::new("vision-1"),
            service_id: "jobs".into(),
            user_id: "u1".into(),
            locale: "en".into(),
            template_id: "job_summary".into(),
            variables: serde_json::json!({"modality": "text"}),
            enqueued_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            retry_count: 0,
            has_quota: false,
            debit_id: None,
        }
    }

    #[test]
    fn deserializes_camel_case_body_with_defaults() {
        let body = serde_json::json!({
            "taskId": "t-1",
            "serviceId": "jobs",
            "userId": "u1",
            "locale": "ja",
            "templateId": "summary",
            "variables": {"a": 1},
            "enqueuedAt": "2024-05-01T10:00:00Z",
        });
        let inv: TaskInvocation = serde_json::from_value(body).unwrap();

        assert_eq!(inv.task_id.as_str(), "t-1");
        assert_eq!(inv.retry_count, 0);
        assert!(!inv.has_quota);
        assert_eq!(inv.tier(), Tier::Free);
        assert!(inv.debit_id.is_none());
    }

    #[test]
    fn requeued_copy_increments_retry_count() {
        let original = sample();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let copy = original.requeued(later);

        assert_eq!(copy.retry_count, 1);
        assert_eq!(copy.enqueued_at, later);
        assert_eq!(copy.task_id, original.task_id);
        assert_eq!(original.retry_count, 0);
    }

    #[test]
    fn variable_str_reads_string_values_only() {
        let inv = sample();
        assert_eq!(inv.variable_str("modality"), Some("text"));
        assert_eq!(inv.variable_str("missing"), None);
    }
}
