//! Local key-value storage.
//!
//! Everything the application persists is a string value under a string key,
//! the same model a browser's local storage offers. [`StorageHandle`] keeps
//! those pairs in SQLite; [`MemoryStorage`] keeps them in process memory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

use crate::config::{ConfigPaths, StorageOptions};

mod schema;

/// String keyed, string valued storage with last-write-wins semantics.
pub trait KeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<()>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &T {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        (**self).get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        (**self).set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        (**self).remove_item(key)
    }
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

impl KeyValueStore for StorageHandle {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM local_storage WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("reading storage key {key}"))
        })
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO local_storage (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("writing storage key {key}"))?;
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM local_storage WHERE key = ?1", params![key])
                .with_context(|| format!("removing storage key {key}"))?;
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().remove(key);
        Ok(())
    }
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = &paths.database_path;
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    tracing::debug!(path = %db_path.display(), "local storage ready");
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn temp_paths(root: &TempDir) -> ConfigPaths {
        let base = root.path();
        let config_dir = base.join("config");
        let data_dir = base.join("data");
        ConfigPaths {
            config_dir: config_dir.clone(),
            config_file: config_dir.join("config.toml"),
            data_dir: data_dir.clone(),
            database_path: data_dir.join("mynote.db"),
            backup_dir: base.join("backups"),
            origin_dir: data_dir.join("public"),
        }
    }

    pub(crate) fn init_storage() -> Result<(TempDir, StorageHandle)> {
        let temp = TempDir::new()?;
        let paths = temp_paths(&temp);
        paths.ensure_directories()?;
        let storage = init(&paths, &StorageOptions::default())?;
        Ok((temp, storage))
    }

    #[test]
    fn set_item_overwrites_previous_value() -> Result<()> {
        let (_temp, storage) = init_storage()?;
        assert_eq!(storage.get_item("myNotes")?, None);

        storage.set_item("myNotes", "[]")?;
        storage.set_item("myNotes", "[1]")?;
        assert_eq!(storage.get_item("myNotes")?.as_deref(), Some("[1]"));
        Ok(())
    }

    #[test]
    fn remove_item_is_idempotent() -> Result<()> {
        let (_temp, storage) = init_storage()?;
        storage.set_item("darkMode", "true")?;
        storage.remove_item("darkMode")?;
        storage.remove_item("darkMode")?;
        assert_eq!(storage.get_item("darkMode")?, None);
        Ok(())
    }

    #[test]
    fn values_survive_reopening_the_database() -> Result<()> {
        let temp = TempDir::new()?;
        let paths = temp_paths(&temp);
        paths.ensure_directories()?;
        {
            let storage = init(&paths, &StorageOptions::default())?;
            storage.set_item("fontSize", "large")?;
        }
        let reopened = init(&paths, &StorageOptions::default())?;
        assert_eq!(reopened.get_item("fontSize")?.as_deref(), Some("large"));
        Ok(())
    }

    #[test]
    fn memory_storage_behaves_like_local_storage() -> Result<()> {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());
        storage.set_item("a", "1")?;
        storage.set_item("a", "2")?;
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get_item("a")?.as_deref(), Some("2"));
        storage.remove_item("a")?;
        assert_eq!(storage.get_item("a")?, None);
        Ok(())
    }
}
