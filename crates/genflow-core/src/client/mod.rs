//! Client Stream Consumer.
//!
//! A pure reducer over stream deliveries. It owns the pipeline state shown to
//! a user and never performs I/O: every side effect (subscribe, timers,
//! close) comes back as an [`Effect`] for the caller to carry out.
//! [`ConsumerDriver`] is the in-process caller used by tests and tools.

mod buffers;
mod driver;
mod status;
mod supervisor;

pub use buffers::{DeliveryTracker, PhaseBuffers};
pub use driver::ConsumerDriver;
pub use status::StatusLadder;
pub use supervisor::{ConnectionState, ConnectionSupervisor, TimerCommand};

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ClientConfig;
use crate::domain::{
    ErrorStage, Event, EventBody, Phase, PipelineStatus, StageStatus, StreamId, TaskId, Tier,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientInput {
    /// An entry read from `task_id`'s channel. Ids are deduplicated and
    /// tracked per channel task.
    Delivered {
        task_id: TaskId,
        id: StreamId,
        event: Event,
    },
    /// Status learned out of band (e.g. a status poll).
    StatusUpdate {
        status: PipelineStatus,
        task_id: Option<TaskId>,
    },
    Opened,
    TransportError,
    ReconnectTimerFired,
    FlushTimerFired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Subscribe {
        task_id: TaskId,
        cursor: Option<StreamId>,
    },
    ArmReconnectTimer(Duration),
    CancelReconnectTimer,
    ScheduleFlush(Duration),
    Closed,
}

/// What a user sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPipelineState {
    pub status: PipelineStatus,
    pub status_detail: Option<String>,
    pub error_message: Option<String>,
    pub connection: ConnectionState,
}

pub struct StreamConsumer {
    ladder: StatusLadder,
    config: ClientConfig,
    state: ClientPipelineState,
    active: TaskId,
    last_non_match: Option<Phase>,
    buffers: PhaseBuffers,
    deliveries: DeliveryTracker,
    supervisor: ConnectionSupervisor,
    held_error: Option<String>,
    flush_scheduled: bool,
}

impl StreamConsumer {
    pub fn new(tier: Tier, task_id: TaskId, config: ClientConfig) -> Self {
        let supervisor = ConnectionSupervisor::new(config.reconnect_delay());
        Self {
            ladder: StatusLadder::for_tier(tier),
            config,
            state: ClientPipelineState {
                status: PipelineStatus::Idle,
                status_detail: None,
                error_message: None,
                connection: supervisor.state(),
            },
            active: task_id,
            last_non_match: None,
            buffers: PhaseBuffers::new(),
            deliveries: DeliveryTracker::new(),
            supervisor,
            held_error: None,
            flush_scheduled: false,
        }
    }

    /// The task was admitted: its phase goes to `PENDING` and the first
    /// subscription is requested.
    pub fn start(&mut self) -> Vec<Effect> {
        let phase = self
            .active
            .phase_hint()
            .filter(|p| self.ladder.contains(*p))
            .unwrap_or_else(|| self.ladder.first());
        self.set_status(PipelineStatus::at(phase, StageStatus::Pending));
        vec![Effect::Subscribe {
            task_id: self.active.clone(),
            cursor: self.deliveries.cursor(&self.active),
        }]
    }

    pub fn state(&self) -> &ClientPipelineState {
        &self.state
    }

    pub fn status(&self) -> PipelineStatus {
        self.state.status
    }

    pub fn active_task(&self) -> &TaskId {
        &self.active
    }

    pub fn cursor(&self, task_id: &TaskId) -> Option<StreamId> {
        self.deliveries.cursor(task_id)
    }

    pub fn content(&self, phase: Phase) -> &str {
        self.buffers.text(phase)
    }

    /// Canonical result for a phase, when one arrived.
    pub fn result(&self, phase: Phase) -> Option<&Value> {
        self.buffers.structured(phase)
    }

    pub fn is_closed(&self) -> bool {
        self.supervisor.state() == ConnectionState::Closed
    }

    pub fn apply(&mut self, input: ClientInput) -> Vec<Effect> {
        if self.is_closed() {
            return Vec::new();
        }
        let mut effects = Vec::new();
        match input {
            ClientInput::Delivered { task_id, id, event } => {
                if self.deliveries.accept(&task_id, id) {
                    let following = task_id == self.active;
                    self.on_event(id, event, following, &mut effects);
                } else {
                    debug!(%id, %task_id, "duplicate delivery dropped");
                }
            }
            ClientInput::StatusUpdate { status, task_id } => {
                self.on_status(status, task_id, None, &mut effects);
            }
            ClientInput::Opened => {
                let command = self.supervisor.on_opened();
                self.push_timer(command, &mut effects);
            }
            ClientInput::TransportError => {
                let command = self.supervisor.on_transport_error();
                self.push_timer(command, &mut effects);
            }
            ClientInput::ReconnectTimerFired => {
                if self.supervisor.on_timer_fired() {
                    effects.push(Effect::Subscribe {
                        task_id: self.active.clone(),
                        cursor: self.deliveries.cursor(&self.active),
                    });
                }
            }
            ClientInput::FlushTimerFired => {
                self.flush_scheduled = false;
                self.buffers.flush();
            }
        }
        self.state.connection = self.supervisor.state();
        effects
    }

    /// `following` is false for entries from a channel the consumer already
    /// switched away from; they fill in that stage but never close.
    fn on_event(&mut self, id: StreamId, event: Event, following: bool, effects: &mut Vec<Effect>) {
        let Event { body, task_id, .. } = event;
        match body {
            EventBody::Status {
                status,
                failure_code,
                ..
            } => self.on_status(status, task_id, failure_code, effects),
            EventBody::Token { text } | EventBody::TokenBatch { text, .. } => {
                let phase = self.target_phase(task_id.as_ref());
                self.buffers.push(phase, id, &text);
                self.promote(phase, StageStatus::Pending, StageStatus::Streaming);
                if !self.flush_scheduled {
                    self.flush_scheduled = true;
                    effects.push(Effect::ScheduleFlush(self.config.flush_interval()));
                }
            }
            EventBody::Start => {
                let phase = self.target_phase(task_id.as_ref());
                self.promote(phase, StageStatus::Pending, StageStatus::Streaming);
            }
            EventBody::Done { text, data, .. } => {
                let phase = self.target_phase(task_id.as_ref());
                self.buffers.flush();
                if let Some(data) = data {
                    self.buffers.set_structured(phase, data);
                }
                if let Some(text) = text {
                    self.buffers.seed(phase, &text);
                }
                self.promote(phase, StageStatus::Pending, StageStatus::Completed);
                self.promote(phase, StageStatus::Streaming, StageStatus::Completed);
                if following {
                    self.close(effects);
                } else {
                    debug!(?phase, "earlier stage finished after hand-off");
                }
            }
            EventBody::Error {
                message,
                stage,
                code,
            } => {
                if !following {
                    debug!(?code, "error from a channel no longer followed");
                } else if stage == Some(ErrorStage::Terminal) {
                    self.state.error_message = Some(message);
                    if let Some(phase) = self.state.status.phase() {
                        self.set_status(PipelineStatus::at(phase, StageStatus::Failed));
                    }
                    self.close(effects);
                } else {
                    debug!(?code, "holding error until a failed status arrives");
                    self.held_error = Some(message);
                }
            }
            EventBody::OcrResult { json } => self.buffers.set_structured(Phase::Ocr, json),
            EventBody::SummaryResult { json } => self.buffers.set_structured(Phase::Summary, json),
            EventBody::MatchResult { json } => self.buffers.set_structured(Phase::Match, json),
            EventBody::Info { code } => self.state.status_detail = Some(code),
        }
    }

    fn on_status(
        &mut self,
        status: PipelineStatus,
        task_id: Option<TaskId>,
        failure_code: Option<String>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(rank) = self.ladder.rank(status) else {
            debug!(%status, "status not on this tier's ladder");
            return;
        };
        let current = self.ladder.rank(self.state.status).unwrap_or(0);
        if rank <= current {
            debug!(%status, current = %self.state.status, "stale status ignored");
            return;
        }

        let handoff = self.ladder.is_handoff(self.state.status, status);
        self.set_status(status);

        if status.is_failed() {
            self.state.error_message = self.held_error.take().or(failure_code);
            self.close(effects);
            return;
        }

        if handoff && let Some(next) = task_id.filter(|next| *next != self.active) {
            self.buffers.flush();
            let command = self.supervisor.on_switch();
            self.push_timer(command, effects);
            debug!(from = %self.active, to = %next, "switching subscription");
            self.active = next;
            effects.push(Effect::Subscribe {
                task_id: self.active.clone(),
                cursor: self.deliveries.cursor(&self.active),
            });
        }
    }

    /// Buffer a fragment goes to: the event's task prefix, else the phase
    /// the current status implies, else the last non-match phase seen.
    fn target_phase(&self, task_id: Option<&TaskId>) -> Phase {
        task_id
            .and_then(TaskId::phase_hint)
            .or_else(|| self.implied_phase())
            .or(self.last_non_match)
            .unwrap_or_else(|| self.ladder.first())
    }

    /// A match that is still enqueuing implies nothing yet.
    fn implied_phase(&self) -> Option<Phase> {
        match self.state.status {
            PipelineStatus::At {
                phase: Phase::Match,
                status: StageStatus::Pending,
            } => None,
            status => status.phase(),
        }
    }

    fn promote(&mut self, phase: Phase, from: StageStatus, to: StageStatus) {
        if self.state.status == PipelineStatus::at(phase, from) {
            self.set_status(PipelineStatus::at(phase, to));
        }
    }

    fn set_status(&mut self, status: PipelineStatus) {
        if let Some(phase) = status.phase()
            && phase != Phase::Match
        {
            self.last_non_match = Some(phase);
        }
        self.state.status = status;
    }

    fn close(&mut self, effects: &mut Vec<Effect>) {
        self.buffers.flush();
        let command = self.supervisor.close();
        self.push_timer(command, effects);
        effects.push(Effect::Closed);
    }

    fn push_timer(&self, command: Option<TimerCommand>, effects: &mut Vec<Effect>) {
        match command {
            Some(TimerCommand::Arm(delay)) => effects.push(Effect::ArmReconnectTimer(delay)),
            Some(TimerCommand::Cancel) => effects.push(Effect::CancelReconnectTimer),
            None => {}
        }
    }
}
