//! Events published on a task channel.
//!
//! Events are facts: once appended to the log they are never mutated. The
//! JSON shape is the wire contract consumed by stream clients, so field names
//! are camelCase and the variant lives in a `type` tag.
//!
//! `task_id` on the envelope names the task the event is about. Every event
//! a worker emits carries its own task id, except the hand-off status
//! (`{NEXT}_PENDING`), which carries the id of the task that takes over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::stage::{PipelineStatus, Stage};

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Whether an `error` event ends the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Transient,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventBody {
    Status {
        status: PipelineStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_code: Option<String>,
    },
    Token {
        text: String,
    },
    TokenBatch {
        text: String,
        count: usize,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    Start,
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        #[serde(alias = "error")]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<ErrorStage>,
    },
    OcrResult {
        json: serde_json::Value,
    },
    SummaryResult {
        json: serde_json::Value,
    },
    MatchResult {
        json: serde_json::Value,
    },
    Info {
        code: String,
    },
}

impl EventBody {
    /// Structured result event for a stage, for stages that have one.
    pub fn stage_result(stage: Stage, json: serde_json::Value) -> Option<Self> {
        match stage {
            Stage::Ocr => Some(EventBody::OcrResult { json }),
            Stage::Summary => Some(EventBody::SummaryResult { json }),
            Stage::Match => Some(EventBody::MatchResult { json }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::Status { .. } => "status",
            EventBody::Token { .. } => "token",
            EventBody::TokenBatch { .. } => "token_batch",
            EventBody::Start => "start",
            EventBody::Done { .. } => "done",
            EventBody::Error { .. } => "error",
            EventBody::OcrResult { .. } => "ocr_result",
            EventBody::SummaryResult { .. } => "summary_result",
            EventBody::MatchResult { .. } => "match_result",
            EventBody::Info { .. } => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(flatten)]
    pub body: EventBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Event {
    pub fn new(body: EventBody) -> Self {
        Self {
            body,
            task_id: None,
            request_id: None,
            trace_id: None,
        }
    }

    pub fn for_task(task_id: TaskId, body: EventBody) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::new(body)
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn status(task_id: TaskId, status: PipelineStatus) -> Self {
        Self::for_task(
            task_id,
            EventBody::Status {
                status,
                code: None,
                failure_code: None,
            },
        )
    }

    pub fn is_token(&self) -> bool {
        matches!(self.body, EventBody::Token { .. })
    }

    /// Terminal events end a channel: `done`, any `*_FAILED` status, or an
    /// error marked terminal.
    pub fn is_terminal(&self) -> bool {
        match &self.body {
            EventBody::Done { .. } => true,
            EventBody::Status { status, .. } => status.is_failed(),
            EventBody::Error { stage, .. } => *stage == Some(ErrorStage::Terminal),
            _ => false,
        }
    }

    /// Diagnostics only published in development.
    pub fn is_debug(&self) -> bool {
        matches!(&self.body, EventBody::Info { code } if code.starts_with("debug."))
    }
}
