// Peer transports, presence directory and offline relay polling.

pub mod error;
pub mod memory;
pub mod presence;
pub mod relay;
pub mod tcp;
pub mod transport;

pub use error::NetError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use presence::{MemoryDirectory, MemoryPresence, PresenceClient, Snapshot};
pub use relay::{spawn_relay_poller, HttpRelayClient, PendingMessage, RelayClient};
pub use tcp::TcpTransport;
pub use transport::{Transport, TransportEvent};
