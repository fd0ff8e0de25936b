//! Domain identifiers.
//!
//! Two families live here:
//! - `Id<T>`: ULID-backed ids we mint ourselves (queue message ids). The
//!   phantom marker keeps different id kinds from being mixed up at compile time.
//! - String newtypes (`TaskId`, `DebitId`): ids handed to us by callers. We do
//!   not control their format, so they stay opaque strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

use super::stage::{Phase, Stage};

/// Marker trait for `Id<T>`; supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID id. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for queue messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Identifier the Task Queue hands back for an accepted delivery.
pub type MessageId = Id<Message>;

/// Caller-assigned task identifier.
///
/// Pipeline stages mint ids of the form `"{stage}-{ulid}"`; `phase_hint`
/// recovers the phase from that prefix so stream consumers can route token
/// events without consulting the current status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a stage-prefixed id.
    pub fn for_stage(stage: Stage, ulid: Ulid) -> Self {
        Self(format!("{}-{}", stage.as_str(), ulid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Phase encoded in the id prefix, if any. Accepts `-` or `:` as separator.
    pub fn phase_hint(&self) -> Option<Phase> {
        let prefix = self.0.split(['-', ':']).next()?;
        if prefix.len() == self.0.len() {
            return None;
        }
        prefix.parse::<Stage>().ok().and_then(Stage::phase)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Debit reference for a pre-paid task. Refunds are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebitId(String);

impl DebitId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DebitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
