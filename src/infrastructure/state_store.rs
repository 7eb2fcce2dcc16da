use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const OVERRIDES_KEY: &str = "overrides";
pub const RECOMPUTE_INTERVAL_KEY: &str = "recompute_interval_seconds";
pub const DRY_RUN_KEY: &str = "dry_run";

/// Small string key/value store for operator state that must survive restarts.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError>;
    fn set(&self, key: &str, value: &str) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    db_path: PathBuf,
}

impl SqliteStateStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        let connection = self.connect()?;
        let value = connection
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO kv_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    values: Mutex<HashMap<String, String>>,
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        let values = self
            .values
            .lock()
            .map_err(|error| InfraError::lock_poisoned("state store", error))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        let mut values = self
            .values
            .lock()
            .map_err(|error| InfraError::lock_poisoned("state store", error))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Reads a numeric tunable, ignoring values that do not parse.
pub fn read_u64(store: &dyn StateStore, key: &str) -> Result<Option<u64>, InfraError> {
    Ok(store
        .get(key)?
        .and_then(|value| value.trim().parse::<u64>().ok()))
}

pub fn read_bool(store: &dyn StateStore, key: &str) -> Result<Option<bool>, InfraError> {
    Ok(store
        .get(key)?
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        }))
}
