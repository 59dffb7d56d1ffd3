use thiserror::Error;

use crate::types::PeerAddress;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is missing field `{0}`")]
    MissingField(&'static str),

    #[error("Friend profile has no name")]
    EmptyProfileName,
}

/// Non-fatal faults. None of them terminates the host: each degrades to a
/// state transition or a dropped operation, and is reported as a notice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerAddress),

    #[error("Connection attempt to {0} timed out")]
    ConnectionTimeout(PeerAddress),

    #[error("Duplicate connection from {0} rejected")]
    DuplicateConnection(PeerAddress),

    #[error("Transport fault: {0}")]
    TransportFault(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Persistence fault: {0}")]
    PersistenceFault(String),
}
