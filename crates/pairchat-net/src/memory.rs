//! In-process transport.
//!
//! [`MemoryNetwork`] is a hub shared by any number of [`MemoryTransport`]
//! endpoints living in the same process. Frames between two endpoints are
//! delivered in send order. A target can be marked unresponsive so that
//! dials to it silently never complete.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use pairchat_shared::protocol::Frame;
use pairchat_shared::types::{ConnectionId, ConnectionRole, PeerAddress};

use crate::error::{NetError, Result};
use crate::transport::{Transport, TransportEvent};

#[derive(Debug)]
struct LinkEnd {
    owner: PeerAddress,
    remote: PeerAddress,
    /// `None` while a dial to an unresponsive target hangs.
    remote_conn: Option<ConnectionId>,
    role: ConnectionRole,
    open: bool,
}

#[derive(Debug, Default)]
struct Hub {
    endpoints: HashMap<PeerAddress, mpsc::UnboundedSender<TransportEvent>>,
    ends: HashMap<ConnectionId, LinkEnd>,
    unresponsive: HashSet<PeerAddress>,
    next_conn: u64,
}

impl Hub {
    fn next_id(&mut self) -> ConnectionId {
        self.next_conn += 1;
        ConnectionId(self.next_conn)
    }

    fn emit(&self, to: &PeerAddress, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(to) {
            trace!(to = %to.short(), event = ?event, "Memory transport event");
            let _ = tx.send(event);
        }
    }

    /// Tear down `conn` and its remote half, notifying the remote side.
    fn drop_link(&mut self, conn: ConnectionId) {
        let Some(end) = self.ends.remove(&conn) else {
            return;
        };
        if let Some(remote_conn) = end.remote_conn {
            if self.ends.remove(&remote_conn).is_some() {
                self.emit(&end.remote, TransportEvent::Closed { conn: remote_conn });
            }
        }
    }
}

/// Shared in-process network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an endpoint at `address`, replacing any previous one.
    pub fn endpoint(
        &self,
        address: PeerAddress,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub().endpoints.insert(address.clone(), tx);
        debug!(addr = %address.short(), "Memory endpoint registered");
        (
            MemoryTransport {
                network: self.clone(),
                address,
            },
            rx,
        )
    }

    /// Make dials to `address` hang forever (or restore normal behaviour).
    pub fn set_unresponsive(&self, address: &PeerAddress, unresponsive: bool) {
        let mut hub = self.hub();
        if unresponsive {
            hub.unresponsive.insert(address.clone());
        } else {
            hub.unresponsive.remove(address);
        }
    }

    /// Remove an endpoint abruptly, closing every link it takes part in.
    pub fn disconnect(&self, address: &PeerAddress) {
        let mut hub = self.hub();
        hub.endpoints.remove(address);
        let owned: Vec<ConnectionId> = hub
            .ends
            .iter()
            .filter(|(_, end)| &end.owner == address)
            .map(|(id, _)| *id)
            .collect();
        for conn in owned {
            hub.drop_link(conn);
        }
        debug!(addr = %address.short(), "Memory endpoint disconnected");
    }

    /// Number of open link ends owned by `address`.
    pub fn open_connections(&self, address: &PeerAddress) -> usize {
        self.hub()
            .ends
            .values()
            .filter(|end| &end.owner == address && end.open)
            .count()
    }
}

/// One participant's view of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: PeerAddress,
}

impl Transport for MemoryTransport {
    fn local_address(&self) -> &PeerAddress {
        &self.address
    }

    fn connect(&mut self, target: &PeerAddress, role: ConnectionRole) -> Result<ConnectionId> {
        let mut hub = self.network.hub();
        let conn = hub.next_id();

        if !hub.endpoints.contains_key(target) {
            debug!(target = %target.short(), %conn, "Dial to unknown endpoint");
            hub.emit(
                &self.address,
                TransportEvent::Failed {
                    conn,
                    error: format!("peer {target} unreachable"),
                },
            );
            return Ok(conn);
        }

        if hub.unresponsive.contains(target) {
            debug!(target = %target.short(), %conn, "Dial into the void");
            hub.ends.insert(
                conn,
                LinkEnd {
                    owner: self.address.clone(),
                    remote: target.clone(),
                    remote_conn: None,
                    role,
                    open: false,
                },
            );
            return Ok(conn);
        }

        let remote_conn = hub.next_id();
        hub.ends.insert(
            conn,
            LinkEnd {
                owner: self.address.clone(),
                remote: target.clone(),
                remote_conn: Some(remote_conn),
                role,
                open: false,
            },
        );
        hub.ends.insert(
            remote_conn,
            LinkEnd {
                owner: target.clone(),
                remote: self.address.clone(),
                remote_conn: Some(conn),
                role,
                open: false,
            },
        );
        hub.emit(
            target,
            TransportEvent::Incoming {
                conn: remote_conn,
                peer: self.address.clone(),
                role,
            },
        );
        Ok(conn)
    }

    fn accept(&mut self, conn: ConnectionId) -> Result<ConnectionRole> {
        let mut hub = self.network.hub();
        let (remote, remote_conn, role) = match hub.ends.get_mut(&conn) {
            Some(end) if end.owner == self.address => {
                end.open = true;
                (end.remote.clone(), end.remote_conn, end.role)
            }
            _ => return Err(NetError::UnknownConnection(conn)),
        };
        let remote_conn = remote_conn.ok_or(NetError::UnknownConnection(conn))?;
        match hub.ends.get_mut(&remote_conn) {
            Some(end) => end.open = true,
            None => {
                hub.ends.remove(&conn);
                return Err(NetError::Unreachable(remote));
            }
        }

        hub.emit(
            &self.address,
            TransportEvent::Opened {
                conn,
                peer: remote.clone(),
            },
        );
        hub.emit(
            &remote,
            TransportEvent::Opened {
                conn: remote_conn,
                peer: self.address.clone(),
            },
        );
        Ok(role)
    }

    fn reject(&mut self, conn: ConnectionId) {
        self.network.hub().drop_link(conn);
    }

    fn send(&mut self, conn: ConnectionId, frame: &Frame) -> Result<()> {
        let data = frame.to_bytes()?;
        let hub = self.network.hub();
        let end = hub
            .ends
            .get(&conn)
            .filter(|end| end.owner == self.address)
            .ok_or(NetError::UnknownConnection(conn))?;
        if !end.open {
            return Err(NetError::NotOpen(conn));
        }
        let remote_conn = end.remote_conn.ok_or(NetError::NotOpen(conn))?;
        hub.emit(
            &end.remote,
            TransportEvent::Data {
                conn: remote_conn,
                data,
            },
        );
        Ok(())
    }

    fn close(&mut self, conn: ConnectionId) {
        self.network.hub().drop_link(conn);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.disconnect(&self.address);
    }
}
