//! Transport abstraction.
//!
//! A transport dials and accepts role-tagged connections and reports their
//! lifecycle as [`TransportEvent`]s on an unbounded channel handed out at
//! construction. All operations return immediately; completion (open,
//! failure, close) is always reported through the event channel.

use pairchat_shared::protocol::Frame;
use pairchat_shared::types::{ConnectionId, ConnectionRole, PeerAddress};

use crate::error::Result;

/// Lifecycle notifications sent *from* a transport to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote peer dialed us. Must be answered with `accept` or `reject`.
    Incoming {
        conn: ConnectionId,
        peer: PeerAddress,
        role: ConnectionRole,
    },
    /// A connection (dialed or accepted) completed its handshake.
    Opened { conn: ConnectionId, peer: PeerAddress },
    /// A discrete frame arrived, still encoded.
    Data { conn: ConnectionId, data: Vec<u8> },
    /// The remote side closed the connection, or rejected our dial.
    Closed { conn: ConnectionId },
    /// The dial failed or the link broke.
    Failed { conn: ConnectionId, error: String },
}

impl TransportEvent {
    pub fn conn(&self) -> ConnectionId {
        match self {
            Self::Incoming { conn, .. }
            | Self::Opened { conn, .. }
            | Self::Data { conn, .. }
            | Self::Closed { conn }
            | Self::Failed { conn, .. } => *conn,
        }
    }
}

/// Low-level connect/accept/send/close over some peer transport.
///
/// Closing locally does not emit a `Closed` event back to the caller.
pub trait Transport: Send {
    /// This participant's per-run address.
    fn local_address(&self) -> &PeerAddress;

    /// Start dialing `target`. The role tag travels as dial-time metadata.
    fn connect(&mut self, target: &PeerAddress, role: ConnectionRole) -> Result<ConnectionId>;

    /// Complete the handshake of an `Incoming` connection.
    fn accept(&mut self, conn: ConnectionId) -> Result<ConnectionRole>;

    /// Refuse an `Incoming` connection without completing the handshake.
    fn reject(&mut self, conn: ConnectionId);

    /// Send one frame over an open connection.
    fn send(&mut self, conn: ConnectionId, frame: &Frame) -> Result<()>;

    /// Close a connection in any state. Unknown ids are ignored.
    fn close(&mut self, conn: ConnectionId);
}
