//! # pairchat-store
//!
//! Local persistence for pairchat behind an opaque key-value port.
//!
//! The engine only needs get/set/append on JSON values; [`KeyValueStore`] is
//! that port, with an in-memory backend and a SQLite backend. Typed helpers
//! cover the friend list, the recent-peers log, per-peer conversation
//! history and the durable client id.

pub mod database;
pub mod friends;
pub mod history;
pub mod identity;
pub mod kv;
pub mod migrations;
pub mod models;
pub mod recent;

mod error;

pub use database::SqliteStore;
pub use error::{Result, StoreError};
pub use kv::{KeyValueExt, KeyValueStore, MemoryStore};
pub use models::*;
pub use recent::RecentPeers;
