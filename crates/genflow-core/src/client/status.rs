//! Status ladder lookup.
//!
//! Every status a tier can show gets a rank: `IDLE` first, then each ladder
//! phase's `PENDING`, `STREAMING`, `COMPLETED`, `FAILED` in order. Anything
//! not on the tier's ladder has no rank and is ignored by the consumer.

use crate::domain::{Phase, PipelineStatus, StageStatus, Tier};

const STATUS_ORDER: [StageStatus; 4] = [
    StageStatus::Pending,
    StageStatus::Streaming,
    StageStatus::Completed,
    StageStatus::Failed,
];

#[derive(Debug, Clone)]
pub struct StatusLadder {
    tier: Tier,
    table: Vec<PipelineStatus>,
}

impl StatusLadder {
    pub fn for_tier(tier: Tier) -> Self {
        let mut table = vec![PipelineStatus::Idle];
        for &phase in tier.ladder() {
            table.extend(STATUS_ORDER.iter().map(|&s| PipelineStatus::at(phase, s)));
        }
        Self { tier, table }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn rank(&self, status: PipelineStatus) -> Option<usize> {
        self.table.iter().position(|s| *s == status)
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.tier.ladder().contains(&phase)
    }

    /// First phase of the ladder.
    pub fn first(&self) -> Phase {
        self.tier.ladder()[0]
    }

    pub fn next(&self, phase: Phase) -> Option<Phase> {
        phase.next(self.tier)
    }

    /// `from` hands off to `to`: a phase that is streaming or completed
    /// moving into the next phase's `PENDING`.
    pub fn is_handoff(&self, from: PipelineStatus, to: PipelineStatus) -> bool {
        let (PipelineStatus::At { phase, status }, PipelineStatus::At { phase: next, status: next_status }) =
            (from, to)
        else {
            return false;
        };
        matches!(status, StageStatus::Streaming | StageStatus::Completed)
            && next_status == StageStatus::Pending
            && self.next(phase) == Some(next)
    }
}
