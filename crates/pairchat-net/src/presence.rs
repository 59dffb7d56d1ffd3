//! Presence directory client.
//!
//! Each participant publishes its own [`PresenceRecord`] and observes the
//! full snapshot of everyone's records. A client can only ever write the
//! record keyed by its own address.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use pairchat_shared::types::{PeerAddress, PresenceRecord, PresenceStatus, Profile};

use crate::error::Result;

/// Full directory contents, keyed by transport address.
pub type Snapshot = Arc<BTreeMap<PeerAddress, PresenceRecord>>;

/// Owner-side view of a presence directory.
pub trait PresenceClient: Send {
    fn address(&self) -> &PeerAddress;

    /// Overwrite this participant's record.
    fn publish(&mut self, status: PresenceStatus, profile: &Profile) -> Result<()>;

    /// Remove this participant's record.
    fn leave(&mut self) -> Result<()>;
}

/// In-process presence directory backed by a `watch` channel.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to snapshot changes. The current snapshot is marked seen.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    /// A client bound to `address`.
    pub fn client(&self, address: PeerAddress) -> MemoryPresence {
        MemoryPresence {
            directory: self.clone(),
            address,
        }
    }

    fn upsert(&self, address: &PeerAddress, status: PresenceStatus, profile: &Profile) {
        self.tx.send_modify(|snapshot| {
            let mut records = (**snapshot).clone();
            match records.get_mut(address) {
                Some(existing) if existing.status == status && &existing.profile == profile => {
                    existing.timestamp = Utc::now();
                }
                _ => {
                    records.insert(
                        address.clone(),
                        PresenceRecord::new(address.clone(), status, profile.clone()),
                    );
                }
            }
            *snapshot = Arc::new(records);
        });
    }

    fn remove(&self, address: &PeerAddress) {
        self.tx.send_if_modified(|snapshot| {
            if !snapshot.contains_key(address) {
                return false;
            }
            let mut records = (**snapshot).clone();
            records.remove(address);
            *snapshot = Arc::new(records);
            true
        });
    }
}

/// A [`MemoryDirectory`] client that writes only its own record.
#[derive(Debug, Clone)]
pub struct MemoryPresence {
    directory: MemoryDirectory,
    address: PeerAddress,
}

impl PresenceClient for MemoryPresence {
    fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn publish(&mut self, status: PresenceStatus, profile: &Profile) -> Result<()> {
        debug!(addr = %self.address.short(), status = ?status, "Publishing presence");
        self.directory.upsert(&self.address, status, profile);
        Ok(())
    }

    fn leave(&mut self) -> Result<()> {
        debug!(addr = %self.address.short(), "Leaving presence directory");
        self.directory.remove(&self.address);
        Ok(())
    }
}
