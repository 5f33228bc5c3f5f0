//! Participant identity and record types

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Stable participant identity within a session.
///
/// Cheap to clone; every audio frame and event carries one.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(Arc<str>);

impl ParticipantId {
    pub fn new(identity: impl AsRef<str>) -> Self {
        Self(Arc::from(identity.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantId({})", self.0)
    }
}

// Arc<str> has no serde support without the "rc" feature; go through &str.
impl Serialize for ParticipantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A participant currently present in the session.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    /// Display name from the room metadata
    pub name: String,
    /// Transport-assigned participant SID (used in transcript telemetry)
    pub sid: String,
    pub joined_at: Instant,
}

impl Participant {
    pub fn new(id: ParticipantId, name: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            sid: sid.into(),
            joined_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let a = ParticipantId::new("alice");
        let b = ParticipantId::new("alice");
        let c = ParticipantId::new("bob");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "alice");
    }

    #[test]
    fn test_identity_serde() {
        let id = ParticipantId::new("alice");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alice\"");
        let back: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
