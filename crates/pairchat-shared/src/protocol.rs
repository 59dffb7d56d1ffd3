use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::message::{Content, MessageId, ReplyRef};
use crate::types::Profile;

/// Frame discriminator. Unrecognized tags decode as [`FrameKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Profile,
    Message,
    Typing,
    Recording,
    Reaction,
    EditMessage,
    VanishMode,
    FriendRequest,
    FriendAccept,
    Seen,
    Disconnect,
    #[serde(other)]
    Unknown,
}

/// Wire frame exchanged over any connection, primary or secondary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_vanish: Option<bool>,
}

impl Frame {
    fn bare(kind: FrameKind) -> Self {
        Self {
            kind,
            payload: None,
            data_type: None,
            id: None,
            message_id: None,
            reply_to: None,
            expiry_duration: None,
            is_vanish: None,
        }
    }

    fn with_payload(kind: FrameKind, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::bare(kind)
        }
    }

    pub fn profile(profile: &Profile) -> Self {
        Self::with_payload(FrameKind::Profile, profile_value(profile))
    }

    pub fn message(
        id: &str,
        content: &Content,
        reply_to: Option<ReplyRef>,
        expiry_ms: Option<u64>,
        is_vanish: bool,
    ) -> Self {
        Self {
            id: Some(id.to_string()),
            data_type: Some(content.data_type().to_string()),
            reply_to,
            expiry_duration: expiry_ms,
            is_vanish: is_vanish.then_some(true),
            ..Self::with_payload(FrameKind::Message, Value::String(content.payload().to_string()))
        }
    }

    pub fn typing(active: bool) -> Self {
        Self::with_payload(FrameKind::Typing, Value::Bool(active))
    }

    pub fn recording(active: bool) -> Self {
        Self::with_payload(FrameKind::Recording, Value::Bool(active))
    }

    pub fn reaction(message_id: &str, emoji: &str) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            ..Self::with_payload(FrameKind::Reaction, Value::String(emoji.to_string()))
        }
    }

    pub fn edit(message_id: &str, text: &str) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            ..Self::with_payload(FrameKind::EditMessage, Value::String(text.to_string()))
        }
    }

    pub fn vanish_mode(enabled: bool) -> Self {
        Self::with_payload(FrameKind::VanishMode, Value::Bool(enabled))
    }

    pub fn friend_request(profile: &Profile) -> Self {
        Self::with_payload(FrameKind::FriendRequest, profile_value(profile))
    }

    pub fn friend_accept(profile: &Profile) -> Self {
        Self::with_payload(FrameKind::FriendAccept, profile_value(profile))
    }

    pub fn seen(message_id: &str) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            ..Self::bare(FrameKind::Seen)
        }
    }

    pub fn disconnect() -> Self {
        Self::bare(FrameKind::Disconnect)
    }

    /// Boolean payload of a toggle frame (`typing`, `recording`, `vanish_mode`).
    pub fn payload_bool(&self) -> Result<bool, ProtocolError> {
        self.payload
            .as_ref()
            .and_then(Value::as_bool)
            .ok_or(ProtocolError::MissingField("payload"))
    }

    pub fn payload_str(&self) -> Result<&str, ProtocolError> {
        self.payload
            .as_ref()
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("payload"))
    }

    pub fn payload_profile(&self) -> Result<Profile, ProtocolError> {
        let value = self
            .payload
            .clone()
            .ok_or(ProtocolError::MissingField("payload"))?;
        serde_json::from_value(value).map_err(ProtocolError::from)
    }

    pub fn message_id(&self) -> Result<&str, ProtocolError> {
        self.message_id
            .as_deref()
            .ok_or(ProtocolError::MissingField("messageId"))
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::from)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::from)
    }
}

fn profile_value(profile: &Profile) -> Value {
    // Profile only holds strings, numbers and lists; serialization cannot fail.
    serde_json::to_value(profile).unwrap_or(Value::Null)
}
