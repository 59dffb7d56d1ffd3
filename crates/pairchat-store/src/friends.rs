use crate::error::Result;
use crate::kv::{KeyValueExt, KeyValueStore};
use crate::models::{FriendRecord, FriendRequest};

pub const FRIENDS_KEY: &str = "friends";
pub const FRIEND_REQUESTS_KEY: &str = "friend_requests";

pub fn load_friends(store: &dyn KeyValueStore) -> Result<Vec<FriendRecord>> {
    Ok(store.get_json(FRIENDS_KEY)?.unwrap_or_default())
}

pub fn save_friends(store: &mut dyn KeyValueStore, friends: &[FriendRecord]) -> Result<()> {
    tracing::debug!(count = friends.len(), "saving friend list");
    store.set_json(FRIENDS_KEY, friends)
}

pub fn load_friend_requests(store: &dyn KeyValueStore) -> Result<Vec<FriendRequest>> {
    Ok(store.get_json(FRIEND_REQUESTS_KEY)?.unwrap_or_default())
}

pub fn save_friend_requests(
    store: &mut dyn KeyValueStore,
    requests: &[FriendRequest],
) -> Result<()> {
    store.set_json(FRIEND_REQUESTS_KEY, requests)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pairchat_shared::types::{PeerAddress, Profile};

    use super::*;
    use crate::kv::MemoryStore;

    #[test]
    fn test_friend_list_round_trip() {
        let mut store = MemoryStore::new();
        assert!(load_friends(&store).unwrap().is_empty());

        let now = Utc::now();
        let friend = FriendRecord {
            key: "stable-1".into(),
            address: PeerAddress::new("addr-1"),
            profile: Profile::named("ana"),
            added_at: now,
            last_seen: now,
        };
        save_friends(&mut store, &[friend.clone()]).unwrap();
        assert_eq!(load_friends(&store).unwrap(), vec![friend]);
    }
}
