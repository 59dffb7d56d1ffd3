use thiserror::Error;

use pairchat_shared::error::ProtocolError;
use pairchat_shared::types::{ConnectionId, PeerAddress};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection {0} is not open")]
    NotOpen(ConnectionId),

    #[error("Peer unreachable: {0}")]
    Unreachable(PeerAddress),

    #[error("Invalid transport address: {0}")]
    InvalidAddress(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
