use std::fmt;

use super::stage::Tier;
use super::task::ExecutionKind;

/// What a concurrency guard is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GuardSubject {
    User(String),
    Model { model_id: String, tier: Tier },
    Queue(String),
}

/// Names one TTL-bounded counter in the counter store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuardKey {
    pub subject: GuardSubject,
    pub kind: ExecutionKind,
}

impl GuardKey {
    pub fn user(user_id: impl Into<String>, kind: ExecutionKind) -> Self {
        Self {
            subject: GuardSubject::User(user_id.into()),
            kind,
        }
    }

    pub fn model(model_id: impl Into<String>, tier: Tier, kind: ExecutionKind) -> Self {
        Self {
            subject: GuardSubject::Model {
                model_id: model_id.into(),
                tier,
            },
            kind,
        }
    }

    pub fn queue(queue_id: impl Into<String>, kind: ExecutionKind) -> Self {
        Self {
            subject: GuardSubject::Queue(queue_id.into()),
            kind,
        }
    }

    /// Counter key. The queue key is the admission backpressure counter.
    pub fn counter_key(&self) -> String {
        match &self.subject {
            GuardSubject::User(user) => format!("guard:user:{user}:{}", self.kind),
            GuardSubject::Model { model_id, tier } => format!("guard:model:{model_id}:{tier}"),
            GuardSubject::Queue(queue_id) => pending_key(queue_id),
        }
    }

    pub fn label(&self) -> &'static str {
        match self.subject {
            GuardSubject::User(_) => "user",
            GuardSubject::Model { .. } => "model",
            GuardSubject::Queue(_) => "queue",
        }
    }
}

impl fmt::Display for GuardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.counter_key())
    }
}

/// Pending-work counter for a routing queue.
pub fn pending_key(queue_id: &str) -> String {
    format!("pending:{queue_id}")
}
