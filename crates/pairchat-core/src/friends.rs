//! Friend list and pending inbound friend requests.

use chrono::{DateTime, Utc};

use pairchat_net::Snapshot;
use pairchat_shared::error::ProtocolError;
use pairchat_shared::types::{PeerAddress, Profile};
use pairchat_store::friends::{load_friend_requests, load_friends, save_friend_requests, save_friends};
use pairchat_store::{FriendRecord, FriendRequest, KeyValueStore};

/// Same participant: stable ids when both sides carry one, address otherwise.
fn same_participant(
    known_address: &PeerAddress,
    known_profile: &Profile,
    address: &PeerAddress,
    profile: &Profile,
) -> bool {
    let stable = |p: &Profile| p.stable_id.clone().filter(|id| !id.is_empty());
    match (stable(known_profile), stable(profile)) {
        (Some(a), Some(b)) => a == b,
        _ => known_address == address,
    }
}

#[derive(Debug, Clone)]
pub struct FriendBook {
    friends: Vec<FriendRecord>,
    requests: Vec<FriendRequest>,
    last_seen_debounce: chrono::Duration,
}

impl FriendBook {
    pub fn new(last_seen_debounce: chrono::Duration) -> Self {
        Self {
            friends: Vec::new(),
            requests: Vec::new(),
            last_seen_debounce,
        }
    }

    pub fn load(
        store: &dyn KeyValueStore,
        last_seen_debounce: chrono::Duration,
    ) -> pairchat_store::Result<Self> {
        Ok(Self {
            friends: load_friends(store)?,
            requests: load_friend_requests(store)?,
            last_seen_debounce,
        })
    }

    pub fn save(&self, store: &mut dyn KeyValueStore) -> pairchat_store::Result<()> {
        save_friends(store, &self.friends)?;
        save_friend_requests(store, &self.requests)
    }

    pub fn friends(&self) -> &[FriendRecord] {
        &self.friends
    }

    pub fn requests(&self) -> &[FriendRequest] {
        &self.requests
    }

    pub fn find(&self, address: &PeerAddress, profile: &Profile) -> Option<&FriendRecord> {
        self.friends
            .iter()
            .find(|f| same_participant(&f.address, &f.profile, address, profile))
    }

    pub fn get(&self, key: &str) -> Option<&FriendRecord> {
        self.friends.iter().find(|f| f.key == key)
    }

    /// Record an inbound request. Returns the new request, or `None` when the
    /// sender already has one pending or is already a friend.
    pub fn receive_request(
        &mut self,
        address: PeerAddress,
        profile: Profile,
        now: DateTime<Utc>,
    ) -> Result<Option<FriendRequest>, ProtocolError> {
        if profile.name.trim().is_empty() {
            return Err(ProtocolError::EmptyProfileName);
        }
        if self.find(&address, &profile).is_some() {
            return Ok(None);
        }
        if let Some(existing) = self
            .requests
            .iter_mut()
            .find(|r| same_participant(&r.address, &r.profile, &address, &profile))
        {
            existing.address = address;
            existing.profile = profile;
            return Ok(None);
        }
        let request = FriendRequest {
            key: profile.identity_key(&address),
            address,
            profile,
            received_at: now,
        };
        self.requests.push(request.clone());
        Ok(Some(request))
    }

    /// Turn a pending request into a friend.
    pub fn accept_request(&mut self, key: &str, now: DateTime<Utc>) -> Option<FriendRecord> {
        let pos = self.requests.iter().position(|r| r.key == key)?;
        let request = self.requests.remove(pos);
        self.add(request.address, request.profile, now)
            .or_else(|| self.get(key).cloned())
    }

    /// Add a friend (e.g. on `friend_accept`). Returns `None` when the person
    /// was already a friend; their address and profile are refreshed instead.
    pub fn add(
        &mut self,
        address: PeerAddress,
        profile: Profile,
        now: DateTime<Utc>,
    ) -> Option<FriendRecord> {
        self.requests
            .retain(|r| !same_participant(&r.address, &r.profile, &address, &profile));
        if let Some(existing) = self
            .friends
            .iter_mut()
            .find(|f| same_participant(&f.address, &f.profile, &address, &profile))
        {
            existing.address = address;
            existing.profile = profile;
            existing.last_seen = now;
            return None;
        }
        let record = FriendRecord {
            key: profile.identity_key(&address),
            address,
            profile,
            added_at: now,
            last_seen: now,
        };
        self.friends.push(record.clone());
        Some(record)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.friends.len();
        self.friends.retain(|f| f.key != key);
        self.friends.len() != before
    }

    /// Refresh `last_seen` (and the current address) of friends visible in
    /// the presence snapshot, at most once per debounce interval each.
    /// Returns whether anything changed.
    pub fn refresh_last_seen(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for friend in &mut self.friends {
            if now - friend.last_seen < self.last_seen_debounce {
                continue;
            }
            let online = snapshot.values().find(|record| {
                same_participant(&friend.address, &friend.profile, &record.address, &record.profile)
            });
            if let Some(record) = online {
                friend.last_seen = now;
                friend.address = record.address.clone();
                changed = true;
            }
        }
        changed
    }
}
