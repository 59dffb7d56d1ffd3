//! Domain records persisted through the key-value port.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be stored as
//! JSON and handed directly to the host UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pairchat_shared::types::{PeerAddress, Profile};

// ---------------------------------------------------------------------------
// Friends
// ---------------------------------------------------------------------------

/// An accepted friend. The only entity persisted across runs by design of
/// the friend list; `last_seen` is refreshed when the friend shows up online.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRecord {
    /// Stable profile id when known, transport address otherwise.
    pub key: String,
    /// Last transport address the friend was seen at.
    pub address: PeerAddress,
    pub profile: Profile,
    pub added_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A friend request received and not yet accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    pub key: String,
    pub address: PeerAddress,
    pub profile: Profile,
    pub received_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Recent peers
// ---------------------------------------------------------------------------

/// A prior session partner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecentPeerRecord {
    pub address: PeerAddress,
    pub profile: Profile,
    pub met_at: DateTime<Utc>,
}

impl RecentPeerRecord {
    /// Whether two records describe the same participant:
    /// stable id first, transport address second.
    pub fn same_peer(&self, address: &PeerAddress, profile: &Profile) -> bool {
        match (self.profile.stable_id.as_deref(), profile.stable_id.as_deref()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => a == b,
            _ => &self.address == address,
        }
    }
}
