//! Events raised by the engine for the host.

use serde::{Deserialize, Serialize};

use pairchat_shared::error::Fault;
use pairchat_shared::message::Message;
use pairchat_shared::types::{PeerAddress, Profile};
use pairchat_store::{FriendRecord, FriendRequest};

use crate::session::SessionState;

/// Which conversation a message or indicator belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "peer")]
pub enum ConversationKey {
    /// The random-match session.
    Primary,
    /// A direct link with the given peer.
    Secondary(PeerAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Typing,
    Recording,
}

/// Notifications sent *from* the engine to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(SessionState),
    /// The session partner announced its profile.
    PartnerProfile(Profile),
    MessageReceived {
        conversation: ConversationKey,
        message: Message,
        /// Cached profile of the sender, for secondary conversations.
        sender_profile: Option<Profile>,
    },
    /// A message changed in place (reaction, edit, read receipt, expiry).
    MessageUpdated {
        conversation: ConversationKey,
        message: Message,
    },
    IndicatorChanged {
        conversation: ConversationKey,
        indicator: Indicator,
        active: bool,
    },
    VanishModeChanged {
        local: bool,
        remote: bool,
    },
    FriendRequestReceived(FriendRequest),
    FriendAccepted(FriendRecord),
    SecondaryOpened(PeerAddress),
    SecondaryClosed(PeerAddress),
    SecondaryProfile {
        peer: PeerAddress,
        profile: Profile,
    },
    /// A message pulled from the offline relay.
    RelayMessage {
        sender_id: String,
        message: Message,
    },
    /// Non-blocking notice. The engine keeps running.
    Fault(Fault),
}
