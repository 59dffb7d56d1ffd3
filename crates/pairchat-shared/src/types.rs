use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-run transport address of a participant. May rotate every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Handle of one transport connection, local to this participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Out-of-band intent carried at dial time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// The random-match session link.
    #[serde(rename = "primary-intent")]
    Primary,
    /// A direct friend/profile link.
    #[serde(rename = "secondary-intent")]
    Secondary,
}

impl ConnectionRole {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Primary => "primary-intent",
            Self::Secondary => "secondary-intent",
        }
    }
}

/// Self-asserted profile attached to an identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Stable client-generated id, survives address rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<String>,
}

impl Profile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Friend and recent-peer identity key: stable id first, address second.
    pub fn identity_key(&self, fallback: &PeerAddress) -> String {
        match self.stable_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => fallback.0.clone(),
        }
    }
}

/// Presence-facing status label.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Waiting,
    Paired,
    Busy,
    Idle,
}

/// A participant's broadcast status record, keyed by `address`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub address: PeerAddress,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
    pub profile: Profile,
}

impl PresenceRecord {
    pub fn new(address: PeerAddress, status: PresenceStatus, profile: Profile) -> Self {
        Self {
            address,
            status,
            timestamp: Utc::now(),
            profile,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.status == PresenceStatus::Waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_prefers_stable_id() {
        let addr = PeerAddress::new("peer-abc");
        let mut profile = Profile::named("ana");
        assert_eq!(profile.identity_key(&addr), "peer-abc");

        profile.stable_id = Some("stable-1".into());
        assert_eq!(profile.identity_key(&addr), "stable-1");

        profile.stable_id = Some(String::new());
        assert_eq!(profile.identity_key(&addr), "peer-abc");
    }

    #[test]
    fn test_role_tags_on_the_wire() {
        let json = serde_json::to_string(&ConnectionRole::Primary).unwrap();
        assert_eq!(json, "\"primary-intent\"");
        let role: ConnectionRole = serde_json::from_str("\"secondary-intent\"").unwrap();
        assert_eq!(role, ConnectionRole::Secondary);
    }

    #[test]
    fn test_short_address() {
        assert_eq!(PeerAddress::new("0123456789").short(), "01234567");
        assert_eq!(PeerAddress::new("abc").short(), "abc");
    }
}
