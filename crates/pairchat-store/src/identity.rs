use pairchat_shared::identity::Identity;
use pairchat_shared::types::Profile;

use crate::error::Result;
use crate::kv::{KeyValueExt, KeyValueStore};

pub const CLIENT_ID_KEY: &str = "client_id";
pub const PROFILE_KEY: &str = "profile";

/// Return the durable client id, generating and storing one on first run.
pub fn load_or_create_client_id(store: &mut dyn KeyValueStore) -> Result<String> {
    if let Some(id) = store.get_json::<String>(CLIENT_ID_KEY)? {
        return Ok(id);
    }
    let id = Identity::generate_client_id();
    tracing::info!(client_id = %id, "generated new client id");
    store.set_json(CLIENT_ID_KEY, &id)?;
    Ok(id)
}

pub fn load_profile(store: &dyn KeyValueStore) -> Result<Option<Profile>> {
    store.get_json(PROFILE_KEY)
}

pub fn save_profile(store: &mut dyn KeyValueStore, profile: &Profile) -> Result<()> {
    store.set_json(PROFILE_KEY, profile)
}
