//! The key-value persistence port.
//!
//! Core logic needs nothing beyond get/set/append on string keys holding
//! JSON values. [`KeyValueExt`] layers typed access on top.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};

pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    fn remove(&mut self, key: &str) -> Result<()>;

    /// Push one JSON item onto the JSON array stored under `key`.
    fn append(&mut self, key: &str, item: &str) -> Result<()> {
        let item: Value = serde_json::from_str(item)?;
        let mut list: Vec<Value> = match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })?,
            None => Vec::new(),
        };
        list.push(item);
        self.set(key, &serde_json::to_string(&list)?)
    }
}

/// Typed JSON helpers for any [`KeyValueStore`].
pub trait KeyValueExt: KeyValueStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }

    fn append_json<T: Serialize + ?Sized>(&mut self, key: &str, item: &T) -> Result<()> {
        let raw = serde_json::to_string(item)?;
        self.append(key, &raw)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueExt for S {}

/// Volatile store, for tests and for hosts that opt out of persistence.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
