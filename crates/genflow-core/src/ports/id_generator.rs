//! IdGenerator port.
//!
//! ULIDs keep ids sortable by creation time without coordination between
//! producers. The timestamp half comes from the injected `Clock`, so tests
//! with a `ManualClock` get deterministic ordering.

use ulid::Ulid;

use crate::domain::{MessageId, Stage, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_message_id(&self) -> MessageId;

    /// Stage-prefixed task id (`summary-01J…`).
    fn generate_task_id(&self, stage: Stage) -> TaskId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_message_id(&self) -> MessageId {
        MessageId::from(self.next_ulid())
    }

    fn generate_task_id(&self, stage: Stage) -> TaskId {
        TaskId::for_stage(stage, self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Phase;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_message_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_message_id();
        let id2 = id_gen.generate_message_id();

        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("msg-"));
    }

    #[test]
    fn timestamp_half_comes_from_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));

        let id1 = id_gen.generate_message_id();
        let id2 = id_gen.generate_message_id();

        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn task_ids_carry_stage_prefix() {
        let id_gen = UlidGenerator::new(SystemClock);
        let id = id_gen.generate_task_id(Stage::Summary);
        assert_eq!(id.phase_hint(), Some(Phase::Summary));
    }
}
