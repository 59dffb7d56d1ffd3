use thiserror::Error;

use pairchat_net::NetError;
use pairchat_shared::error::ProtocolError;
use pairchat_shared::message::MessageId;
use pairchat_store::StoreError;

use crate::events::ConversationKey;
use crate::session::SessionState;

/// Rejections of host operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("No open connection for conversation {0:?}")]
    NotConnected(ConversationKey),

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("Duplicate message id: {0}")]
    DuplicateMessage(MessageId),

    #[error("Message {0} cannot be edited")]
    NotEditable(MessageId),

    #[error("No pending friend request from {0}")]
    UnknownFriendRequest(String),

    #[error("Engine task stopped")]
    Stopped,

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
