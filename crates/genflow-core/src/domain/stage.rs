//! Pipeline stages, ladder phases, and the status vocabulary shared by the
//! worker (which publishes statuses) and the stream consumer (which derives
//! its state from them).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution class. Paid tasks run the long ladder and skip the daily cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Paid,
}

impl Tier {
    pub fn from_quota(has_quota: bool) -> Self {
        if has_quota { Tier::Paid } else { Tier::Free }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Paid => "paid",
        }
    }

    /// Phases this tier walks through, in order.
    pub fn ladder(self) -> &'static [Phase] {
        match self {
            Tier::Free => &[Phase::JobVision, Phase::Match],
            Tier::Paid => &[Phase::Ocr, Phase::Summary, Phase::Prematch, Phase::Match],
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input modality; selects the routing queue alongside the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Vision,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Vision => "vision",
        }
    }
}

impl FromStr for Modality {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Modality::Text),
            "vision" => Ok(Modality::Vision),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Vision,
    Ocr,
    Summary,
    Prematch,
    Match,
    Customize,
    Interview,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Vision => "vision",
            Stage::Ocr => "ocr",
            Stage::Summary => "summary",
            Stage::Prematch => "prematch",
            Stage::Match => "match",
            Stage::Customize => "customize",
            Stage::Interview => "interview",
        }
    }

    /// Ladder phase of this stage. Customize and interview run outside the ladder.
    pub fn phase(self) -> Option<Phase> {
        match self {
            Stage::Vision => Some(Phase::JobVision),
            Stage::Ocr => Some(Phase::Ocr),
            Stage::Summary => Some(Phase::Summary),
            Stage::Prematch => Some(Phase::Prematch),
            Stage::Match => Some(Phase::Match),
            Stage::Customize | Stage::Interview => None,
        }
    }

    /// Stages that take image input by default.
    pub fn default_modality(self) -> Modality {
        match self {
            Stage::Vision | Stage::Ocr => Modality::Vision,
            _ => Modality::Text,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vision" => Ok(Stage::Vision),
            "ocr" => Ok(Stage::Ocr),
            "summary" => Ok(Stage::Summary),
            "prematch" => Ok(Stage::Prematch),
            "match" => Ok(Stage::Match),
            "customize" => Ok(Stage::Customize),
            "interview" => Ok(Stage::Interview),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// A rung of a tier ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    JobVision,
    Ocr,
    Summary,
    Prematch,
    Match,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::JobVision,
        Phase::Ocr,
        Phase::Summary,
        Phase::Prematch,
        Phase::Match,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::JobVision => "JOB_VISION",
            Phase::Ocr => "OCR",
            Phase::Summary => "SUMMARY",
            Phase::Prematch => "PREMATCH",
            Phase::Match => "MATCH",
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            Phase::JobVision => Stage::Vision,
            Phase::Ocr => Stage::Ocr,
            Phase::Summary => Stage::Summary,
            Phase::Prematch => Stage::Prematch,
            Phase::Match => Stage::Match,
        }
    }

    /// Phase after this one on the tier's ladder.
    pub fn next(self, tier: Tier) -> Option<Phase> {
        let ladder = tier.ladder();
        let idx = ladder.iter().position(|p| *p == self)?;
        ladder.get(idx + 1).copied()
    }
}

impl FromStr for Phase {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

/// Progress of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Streaming => "STREAMING",
            StageStatus::Completed => "COMPLETED",
            StageStatus::Failed => "FAILED",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

impl FromStr for StageStatus {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StageStatus::Pending),
            "STREAMING" => Ok(StageStatus::Streaming),
            "COMPLETED" => Ok(StageStatus::Completed),
            "FAILED" => Ok(StageStatus::Failed),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// Wire status: `IDLE` or `{PHASE}_{STATUS}` (e.g. `JOB_VISION_STREAMING`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PipelineStatus {
    Idle,
    At { phase: Phase, status: StageStatus },
}

impl PipelineStatus {
    pub fn at(phase: Phase, status: StageStatus) -> Self {
        PipelineStatus::At { phase, status }
    }

    pub fn phase(self) -> Option<Phase> {
        match self {
            PipelineStatus::Idle => None,
            PipelineStatus::At { phase, .. } => Some(phase),
        }
    }

    pub fn stage_status(self) -> Option<StageStatus> {
        match self {
            PipelineStatus::Idle => None,
            PipelineStatus::At { status, .. } => Some(status),
        }
    }

    pub fn is_failed(self) -> bool {
        self.stage_status() == Some(StageStatus::Failed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Idle => f.write_str("IDLE"),
            PipelineStatus::At { phase, status } => {
                write!(f, "{}_{}", phase.as_str(), status.as_str())
            }
        }
    }
}

impl FromStr for PipelineStatus {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "IDLE" {
            return Ok(PipelineStatus::Idle);
        }
        let (phase, status) = s.rsplit_once('_').ok_or_else(|| UnknownName(s.to_string()))?;
        Ok(PipelineStatus::At {
            phase: phase.parse()?,
            status: status.parse()?,
        })
    }
}

impl TryFrom<String> for PipelineStatus {
    type Error = UnknownName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PipelineStatus> for String {
    fn from(value: PipelineStatus) -> Self {
        value.to_string()
    }
}

/// A name that does not belong to the vocabulary it was parsed against.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown name: {0}")]
pub struct UnknownName(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::idle("IDLE", PipelineStatus::Idle)]
    #[case::two_word_phase("JOB_VISION_PENDING", PipelineStatus::at(Phase::JobVision, StageStatus::Pending))]
    #[case::failed("MATCH_FAILED", PipelineStatus::at(Phase::Match, StageStatus::Failed))]
    #[case::streaming("PREMATCH_STREAMING", PipelineStatus::at(Phase::Prematch, StageStatus::Streaming))]
    fn status_parses_and_displays(#[case] raw: &str, #[case] expected: PipelineStatus) {
        let parsed: PipelineStatus = raw.parse().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), raw);
    }

    #[rstest]
    #[case("JOB_VISION")]
    #[case("VISION_PENDING")]
    #[case("OCR_DONE")]
    #[case("")]
    fn status_rejects_unknown_forms(#[case] raw: &str) {
        assert!(raw.parse::<PipelineStatus>().is_err());
    }

    #[test]
    fn status_serializes_as_wire_string() {
        let json = serde_json::to_string(&PipelineStatus::at(Phase::Ocr, StageStatus::Completed))
            .unwrap();
        assert_eq!(json, "\"OCR_COMPLETED\"");
    }

    #[test]
    fn ladders_differ_by_tier() {
        assert_eq!(Phase::JobVision.next(Tier::Free), Some(Phase::Match));
        assert_eq!(Phase::Ocr.next(Tier::Paid), Some(Phase::Summary));
        assert_eq!(Phase::Prematch.next(Tier::Paid), Some(Phase::Match));
        assert_eq!(Phase::Match.next(Tier::Paid), None);
        assert_eq!(Phase::Summary.next(Tier::Free), None);
    }

    #[test]
    fn customize_and_interview_have_no_phase() {
        assert_eq!(Stage::Customize.phase(), None);
        assert_eq!(Stage::Interview.phase(), None);
        assert_eq!(Stage::Vision.phase(), Some(Phase::JobVision));
    }
}
