//! Bounded, most-recent-first log of prior session partners.

use chrono::{DateTime, Utc};

use pairchat_shared::types::{PeerAddress, Profile};

use crate::error::Result;
use crate::kv::{KeyValueExt, KeyValueStore};
use crate::models::RecentPeerRecord;

pub const RECENT_PEERS_KEY: &str = "recent_peers";

#[derive(Debug, Clone)]
pub struct RecentPeers {
    limit: usize,
    records: Vec<RecentPeerRecord>,
}

impl RecentPeers {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            records: Vec::new(),
        }
    }

    pub fn load(store: &dyn KeyValueStore, limit: usize) -> Result<Self> {
        let mut records: Vec<RecentPeerRecord> =
            store.get_json(RECENT_PEERS_KEY)?.unwrap_or_default();
        records.truncate(limit);
        Ok(Self { limit, records })
    }

    pub fn save(&self, store: &mut dyn KeyValueStore) -> Result<()> {
        store.set_json(RECENT_PEERS_KEY, &self.records)
    }

    /// Move (or insert) the peer to the front, dropping the oldest entry
    /// beyond the limit.
    pub fn record(&mut self, address: PeerAddress, profile: Profile, now: DateTime<Utc>) {
        self.records.retain(|r| !r.same_peer(&address, &profile));
        self.records.insert(
            0,
            RecentPeerRecord {
                address,
                profile,
                met_at: now,
            },
        );
        self.records.truncate(self.limit);
    }

    pub fn records(&self) -> &[RecentPeerRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn profile(name: &str, stable: Option<&str>) -> Profile {
        Profile {
            stable_id: stable.map(str::to_string),
            ..Profile::named(name)
        }
    }

    #[test]
    fn test_most_recent_first_and_bounded() {
        let mut recent = RecentPeers::new(3);
        for i in 0..5 {
            recent.record(PeerAddress::new(format!("a{i}")), profile("p", None), Utc::now());
        }
        let addrs: Vec<&str> = recent.records().iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addrs, vec!["a4", "a3", "a2"]);
    }

    #[test]
    fn test_dedupe_by_stable_id_across_address_rotation() {
        let mut recent = RecentPeers::new(50);
        recent.record(PeerAddress::new("old"), profile("ana", Some("s-1")), Utc::now());
        recent.record(PeerAddress::new("other"), profile("bo", None), Utc::now());
        recent.record(PeerAddress::new("new"), profile("ana", Some("s-1")), Utc::now());

        assert_eq!(recent.len(), 2);
        assert_eq!(recent.records()[0].address.as_str(), "new");
        assert_eq!(recent.records()[1].address.as_str(), "other");
    }

    #[test]
    fn test_dedupe_by_address_without_stable_id() {
        let mut recent = RecentPeers::new(50);
        recent.record(PeerAddress::new("a"), profile("x", None), Utc::now());
        recent.record(PeerAddress::new("a"), profile("x2", None), Utc::now());
        assert_eq!(recent.len(), 1);
        assert_eq!(recent.records()[0].profile.name, "x2");
    }

    #[test]
    fn test_persisted_round_trip() {
        let mut store = MemoryStore::new();
        let mut recent = RecentPeers::new(50);
        recent.record(PeerAddress::new("a"), profile("x", None), Utc::now());
        recent.save(&mut store).unwrap();

        let loaded = RecentPeers::load(&store, 50).unwrap();
        assert_eq!(loaded.records(), recent.records());
    }
}
