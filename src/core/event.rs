//! The event envelope: the unit of capture and query.

use crate::core::timestamp::Timestamp;
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable unique identifier assigned at capture time.
///
/// Uniqueness is a store-wide invariant: no two events, even
/// across partitions, may share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::ValidationError(format!("invalid event id {s:?}: {e}")))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened to the observed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Create => "Create",
            EventKind::Update => "Update",
            EventKind::Delete => "Delete",
        };
        write!(f, "{s}")
    }
}

/// Identity of the Kubernetes resource an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    /// For Kubernetes `Event`-kind resources, the uid of the object the
    /// event is about. Populated by the import enrichment rule,
    /// not by the source directly.
    pub involved_object_uid: Option<String>,
}

impl ResourceRef {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
            involved_object_uid: None,
        }
    }
}

/// A captured, immutable observation of a Kubernetes resource.
///
/// `data` is opaque to the core: it is the source's full observed
/// representation (JSON) at capture time, carried as a blob. The core
/// never inspects it except during the import enrichment rule in `api`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub kind: EventKind,
    pub resource: ResourceRef,
    #[serde(with = "bytes_as_json_value")]
    pub data: Bytes,
}

impl Event {
    pub fn new(timestamp: Timestamp, kind: EventKind, resource: ResourceRef, data: Bytes) -> Self {
        Self {
            id: EventId::new(),
            timestamp,
            kind,
            resource,
            data,
        }
    }

    /// Validate the invariants ingestion must enforce: a
    /// strictly positive timestamp and a non-empty resource identity.
    pub fn validate(&self) -> Result<()> {
        if !self.timestamp.is_positive() {
            return Err(Error::ValidationError(format!(
                "event {} has non-positive timestamp {}",
                self.id,
                self.timestamp.as_nanos()
            )));
        }
        if self.resource.uid.is_empty() {
            return Err(Error::ValidationError(format!(
                "event {} is missing resource.uid",
                self.id
            )));
        }
        if self.resource.kind.is_empty() {
            return Err(Error::ValidationError(format!(
                "event {} is missing resource.kind",
                self.id
            )));
        }
        Ok(())
    }
}

/// Serializes `Bytes` as a JSON string body (the wire/import format carries
/// `data` as an arbitrary JSON value, not a base64 blob) while keeping the
/// in-memory representation a flat byte buffer the core never parses.
mod bytes_as_json_value {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        let value: Value = serde_json::from_slice(data).unwrap_or(Value::Null);
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let bytes = serde_json::to_vec(&value).map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let resource = ResourceRef::new("", "v1", "Pod", "default", "p1", "u1");
        Event::new(
            Timestamp::from_nanos(1_700_000_000_000_000_000),
            EventKind::Create,
            resource,
            Bytes::from_static(br#"{"x":1}"#),
        )
    }

    #[test]
    fn rejects_non_positive_timestamp() {
        let mut event = sample_event();
        event.timestamp = Timestamp::from_nanos(0);
        assert!(event.validate().is_err());
    }

    #[test]
    fn rejects_missing_uid() {
        let mut event = sample_event();
        event.resource.uid.clear();
        assert!(event.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_event() {
        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn json_round_trips_through_serde() {
        let event = sample_event();
        let encoded = serde_json::to_vec(&event).unwrap();
        let decoded: Event = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.resource, event.resource);
        assert_eq!(decoded.data, event.data);
    }
}
