//! Per-phase content buffers and per-task delivery cursors.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use crate::domain::{Phase, StreamId, TaskId};

#[derive(Debug, Default, Clone)]
struct PhaseBuffer {
    committed: String,
    pending: BTreeMap<StreamId, String>,
    structured: Option<Value>,
}

/// Text received per phase. Fragments wait in `pending` (ordered by stream
/// id) until the next flush makes them visible.
#[derive(Debug, Default, Clone)]
pub struct PhaseBuffers {
    phases: HashMap<Phase, PhaseBuffer>,
}

impl PhaseBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, phase: Phase, id: StreamId, text: &str) {
        self.phases
            .entry(phase)
            .or_default()
            .pending
            .entry(id)
            .or_insert_with(|| text.to_string());
    }

    /// Commit every pending fragment. Returns whether anything moved.
    pub fn flush(&mut self) -> bool {
        let mut moved = false;
        for buffer in self.phases.values_mut() {
            for (_, text) in std::mem::take(&mut buffer.pending) {
                buffer.committed.push_str(&text);
                moved = true;
            }
        }
        moved
    }

    pub fn has_pending(&self) -> bool {
        self.phases.values().any(|b| !b.pending.is_empty())
    }

    /// Visible text for a phase.
    pub fn text(&self, phase: Phase) -> &str {
        self.phases.get(&phase).map_or("", |b| b.committed.as_str())
    }

    pub fn is_empty(&self, phase: Phase) -> bool {
        self.phases
            .get(&phase)
            .is_none_or(|b| b.committed.is_empty() && b.pending.is_empty())
    }

    /// Seed an empty phase with text, e.g. the full text carried by `done`.
    pub fn seed(&mut self, phase: Phase, text: &str) {
        if self.is_empty(phase) {
            self.phases.entry(phase).or_default().committed = text.to_string();
        }
    }

    /// Record the canonical structured result for a phase and seed the text
    /// if nothing was streamed for it.
    pub fn set_structured(&mut self, phase: Phase, json: Value) {
        let seed = display_text(&json);
        self.seed(phase, &seed);
        self.phases.entry(phase).or_default().structured = Some(json);
    }

    pub fn structured(&self, phase: Phase) -> Option<&Value> {
        self.phases.get(&phase).and_then(|b| b.structured.as_ref())
    }
}

fn display_text(json: &Value) -> String {
    match json {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("text").or_else(|| map.get("summary")) {
            Some(Value::String(text)) => text.clone(),
            _ => json.to_string(),
        },
        other => other.to_string(),
    }
}

#[derive(Debug, Default, Clone)]
struct TaskCursor {
    seen: HashSet<StreamId>,
    last: Option<StreamId>,
}

/// Delivered stream ids per task. Cursors never cross task ids.
#[derive(Debug, Default, Clone)]
pub struct DeliveryTracker {
    tasks: HashMap<TaskId, TaskCursor>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery. `false` if this id was already delivered for the task.
    pub fn accept(&mut self, task_id: &TaskId, id: StreamId) -> bool {
        let cursor = self.tasks.entry(task_id.clone()).or_default();
        if !cursor.seen.insert(id) {
            return false;
        }
        cursor.last = cursor.last.max(Some(id));
        true
    }

    pub fn cursor(&self, task_id: &TaskId) -> Option<StreamId> {
        self.tasks.get(task_id).and_then(|c| c.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flush_commits_in_stream_order() {
        let mut buffers = PhaseBuffers::new();
        buffers.push(Phase::JobVision, StreamId::new(2, 0), "world");
        buffers.push(Phase::JobVision, StreamId::new(1, 0), "hello ");

        assert_eq!(buffers.text(Phase::JobVision), "");
        assert!(buffers.has_pending());
        assert!(buffers.flush());
        assert_eq!(buffers.text(Phase::JobVision), "hello world");
        assert!(!buffers.flush());
    }

    #[test]
    fn structured_result_seeds_only_empty_phases() {
        let mut buffers = PhaseBuffers::new();
        buffers.set_structured(Phase::Summary, json!({"summary": "fit"}));
        assert_eq!(buffers.text(Phase::Summary), "fit");

        buffers.push(Phase::Match, StreamId::new(1, 0), "streamed");
        buffers.set_structured(Phase::Match, json!({"score": 4, "summary": "other"}));
        buffers.flush();
        assert_eq!(buffers.text(Phase::Match), "streamed");
        assert_eq!(buffers.structured(Phase::Match).unwrap()["score"], 4);
    }

    #[test]
    fn tracker_dedups_and_keeps_cursors_per_task() {
        let mut tracker = DeliveryTracker::new();
        let a = TaskId::new("vision-1");
        let b = TaskId::new("match-2");

        assert!(tracker.accept(&a, StreamId::new(5, 0)));
        assert!(tracker.accept(&a, StreamId::new(3, 0)));
        assert!(!tracker.accept(&a, StreamId::new(5, 0)));
        assert!(tracker.accept(&b, StreamId::new(1, 0)));

        assert_eq!(tracker.cursor(&a), Some(StreamId::new(5, 0)));
        assert_eq!(tracker.cursor(&b), Some(StreamId::new(1, 0)));
        assert_eq!(tracker.cursor(&TaskId::new("other")), None);
    }
}
