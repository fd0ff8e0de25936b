//! Machine-readable failure codes.
//!
//! Admission codes are returned synchronously to the caller. Worker codes
//! travel asynchronously inside `error` / `status` events.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionCode {
    Accepted,
    RateLimited,
    DailyLimitExceeded,
    Backpressured,
    IdempotentReplay,
    EnqueueFailed,
    InternalError,
}

impl AdmissionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AdmissionCode::Accepted => "accepted",
            AdmissionCode::RateLimited => "rate_limited",
            AdmissionCode::DailyLimitExceeded => "daily_limit_exceeded",
            AdmissionCode::Backpressured => "backpressured",
            AdmissionCode::IdempotentReplay => "idempotent_replay",
            AdmissionCode::EnqueueFailed => "enqueue_failed",
            AdmissionCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for AdmissionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorCode {
    ConcurrencyLocked,
    ModelConcurrency,
    QueueBackpressure,
    ProviderNotConfigured,
    LlmError,
    StructuredError,
    InternalError,
}

impl WorkerErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerErrorCode::ConcurrencyLocked => "concurrency_locked",
            WorkerErrorCode::ModelConcurrency => "model_concurrency",
            WorkerErrorCode::QueueBackpressure => "queue_backpressure",
            WorkerErrorCode::ProviderNotConfigured => "provider_not_configured",
            WorkerErrorCode::LlmError => "llm_error",
            WorkerErrorCode::StructuredError => "structured_error",
            WorkerErrorCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for WorkerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
