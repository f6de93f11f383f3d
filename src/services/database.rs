use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::storage::{check_quota, KeyValueStore, StorageError};

/// SQLite-backed key-value table with a byte quota on stored values.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    quota: usize,
}

impl Database {
    pub fn open(path: &Path, quota: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
            quota,
        };
        db.run_migrations()?;

        Ok(db)
    }

    #[cfg(test)]
    pub fn new_in_memory(quota: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
            quota,
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Database("connection lock poisoned".to_string()))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        Ok(())
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let used_by_others: i64 = conn.query_row(
            "SELECT COALESCE(SUM(length(CAST(value AS BLOB))), 0) FROM kv WHERE key != ?1",
            params![key],
            |row| row.get(0),
        )?;
        check_quota(self.quota, used_by_others.max(0) as usize, value.len())?;

        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    fn used_bytes(&self) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(length(CAST(value AS BLOB))), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        Ok(used.max(0) as usize)
    }

    fn quota(&self) -> usize {
        self.quota
    }
}
