//! SQLite backend for the key-value port.
//!
//! The [`SqliteStore`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations are run before any other operation.

use std::path::{Path, PathBuf};

use chrono::Utc;
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::kv::KeyValueStore;
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/pairchat/pairchat.db`
    /// - macOS:   `~/Library/Application Support/com.pairchat.pairchat/pairchat.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\pairchat\pairchat\data\pairchat.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "pairchat", "pairchat").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("pairchat.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn append(&mut self, key: &str, item: &str) -> Result<()> {
        // Read-modify-write inside one transaction.
        let item: serde_json::Value = serde_json::from_str(item)?;
        let tx = self.conn.transaction()?;
        let existing: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        let mut list: Vec<serde_json::Value> = match existing {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })?,
            None => Vec::new(),
        };
        list.push(item);
        tx.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(&list)?, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyValueExt;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut store = SqliteStore::open_at(&path).expect("should open");
            assert!(store.path().is_some());
            store.set("client_id", "\"abc\"").unwrap();
        }

        let store = SqliteStore::open_at(&path).expect("should reopen");
        assert_eq!(store.get("client_id").unwrap().as_deref(), Some("\"abc\""));
    }

    #[test]
    fn test_set_overwrites_and_remove() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.set("k", "1").unwrap();
        store.set("k", "2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("2"));

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_append_in_transaction() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.append_json("history:x", &"first").unwrap();
        store.append_json("history:x", &"second").unwrap();

        let list: Vec<String> = store.get_json("history:x").unwrap().unwrap();
        assert_eq!(list, vec!["first", "second"]);
    }
}
