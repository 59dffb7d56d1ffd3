//! Types shared by every pairchat crate: identity, presence records, the
//! message model, the wire frame codec, the fault taxonomy and the engine
//! configuration.

pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod message;
pub mod protocol;
pub mod types;

pub use config::EngineConfig;
pub use error::{Fault, ProtocolError};
pub use identity::Identity;
pub use message::{Content, DeliveryStatus, Message, MessageId, Reaction, ReplyRef, Sender};
pub use protocol::{Frame, FrameKind};
pub use types::{ConnectionId, ConnectionRole, PeerAddress, PresenceRecord, PresenceStatus, Profile};
