//! Per-peer conversation history for secondary (friend) conversations.

use pairchat_shared::message::Message;

use crate::error::Result;
use crate::kv::{KeyValueExt, KeyValueStore};

fn history_key(peer_key: &str) -> String {
    format!("history:{peer_key}")
}

pub fn append_history(store: &mut dyn KeyValueStore, peer_key: &str, message: &Message) -> Result<()> {
    store.append_json(&history_key(peer_key), message)
}

pub fn load_history(store: &dyn KeyValueStore, peer_key: &str) -> Result<Vec<Message>> {
    Ok(store.get_json(&history_key(peer_key))?.unwrap_or_default())
}

pub fn clear_history(store: &mut dyn KeyValueStore, peer_key: &str) -> Result<()> {
    store.remove(&history_key(peer_key))
}
