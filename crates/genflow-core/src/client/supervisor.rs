//! Connection supervisor.
//!
//! The transport retries on its own after an error. The supervisor only arms
//! a fallback timer; if the transport reconnects first the timer is cancelled,
//! otherwise the consumer resubscribes from its cursor when it fires.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    RetryScheduled,
    Reconnecting,
    Closed,
}

/// Timer command produced by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Arm(Duration),
    Cancel,
}

#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    state: ConnectionState,
    reconnect_delay: Duration,
}

impl ConnectionSupervisor {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Connecting,
            reconnect_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn on_opened(&mut self) -> Option<TimerCommand> {
        let command = self.cancel_pending();
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Connected;
        }
        command
    }

    pub fn on_transport_error(&mut self) -> Option<TimerCommand> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.state = ConnectionState::RetryScheduled;
                Some(TimerCommand::Arm(self.reconnect_delay))
            }
            ConnectionState::RetryScheduled | ConnectionState::Closed => None,
        }
    }

    /// The fallback timer fired. `true` means the caller must resubscribe;
    /// a timer that outlived its retry window is ignored.
    pub fn on_timer_fired(&mut self) -> bool {
        if self.state != ConnectionState::RetryScheduled {
            return false;
        }
        self.state = ConnectionState::Reconnecting;
        true
    }

    /// A new subscription replaces the current one (stage hand-off).
    pub fn on_switch(&mut self) -> Option<TimerCommand> {
        let command = self.cancel_pending();
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Connecting;
        }
        command
    }

    pub fn close(&mut self) -> Option<TimerCommand> {
        let command = self.cancel_pending();
        self.state = ConnectionState::Closed;
        command
    }

    fn cancel_pending(&self) -> Option<TimerCommand> {
        (self.state == ConnectionState::RetryScheduled).then_some(TimerCommand::Cancel)
    }
}
