//! Durable stream entries and their cursors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::events::Event;
use super::ids::TaskId;

/// Log entry id: `{millis}-{seq}`. Strictly increasing within a channel and
/// used by clients as the resumption cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream id: {0}")]
pub struct InvalidStreamId(pub String);

impl FromStr for StreamId {
    type Err = InvalidStreamId;

    /// Accepts `ms-seq` or a bare `ms` (sequence 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidStreamId(s.to_string());
        let (ms, seq) = match s.trim().split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s.trim(), "0"),
        };
        Ok(StreamId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for StreamId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Durable form of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: StreamId,
    pub event: Event,
}

impl StreamEntry {
    /// Event JSON with the entry id folded in as `eventId`, as sent on the wire.
    pub fn to_wire_json(&self) -> serde_json::Value {
        let mut json = serde_json::to_value(&self.event).unwrap_or(serde_json::Value::Null);
        if let Some(map) = json.as_object_mut() {
            map.insert("eventId".into(), serde_json::Value::String(self.id.to_string()));
        }
        json
    }
}

/// Per-task channel name shared by the log and the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn for_task(service_id: &str, user_id: &str, task_id: &TaskId) -> Self {
        Self(format!("stream:{service_id}:{user_id}:{task_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventBody;

    #[test]
    fn stream_ids_order_by_ms_then_seq() {
        let a = StreamId::new(10, 5);
        let b = StreamId::new(11, 0);
        let c = StreamId::new(11, 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn stream_id_parses_both_forms() {
        assert_eq!("1700-3".parse::<StreamId>().unwrap(), StreamId::new(1700, 3));
        assert_eq!("1700".parse::<StreamId>().unwrap(), StreamId::new(1700, 0));
        assert!("abc".parse::<StreamId>().is_err());
        assert!("1-x".parse::<StreamId>().is_err());
    }

    #[test]
    fn wire_json_includes_event_id() {
        let entry = StreamEntry {
            id: StreamId::new(42, 7),
            event: Event::new(EventBody::Start),
        };
        let json = entry.to_wire_json();
        assert_eq!(json["type"], "start");
        assert_eq!(json["eventId"], "42-7");
    }

    #[test]
    fn channel_key_layout() {
        let key = ChannelKey::for_task("jobs", "u1", &TaskId::new("vision-1"));
        assert_eq!(key.as_str(), "stream:jobs:u1:vision-1");
    }
}
