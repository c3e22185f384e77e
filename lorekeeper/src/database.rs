//! SQLite key-value store backing the durable cache tier.
//!
//! One table per partition (`index_store`, `data_store`, `metadata_store`),
//! each a plain `key TEXT PRIMARY KEY, value TEXT` map. Uses r2d2 connection
//! pooling so cache reads do not serialize behind a mutex.

use crate::models::Partition;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionUsage {
    pub entries: u64,
    pub bytes: u64,
}

/// Durable key-value store split into named partitions.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, partition: Partition, key: &str) -> DatabaseResult<Option<String>>;

    fn set(&self, partition: Partition, key: &str, value: &str) -> DatabaseResult<()>;

    /// Apply several writes atomically.
    fn set_many(&self, writes: &[(Partition, &str, &str)]) -> DatabaseResult<()>;

    /// Returns whether the key existed.
    fn remove(&self, partition: Partition, key: &str) -> DatabaseResult<bool>;

    fn keys(&self, partition: Partition) -> DatabaseResult<Vec<String>>;

    fn clear(&self, partition: Partition) -> DatabaseResult<()>;

    fn usage(&self, partition: Partition) -> DatabaseResult<PartitionUsage>;
}

/// Thread-safe database wrapper using connection pooling
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open or create a database at the given path with connection pooling
    pub fn open<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                ",
            )?;
            Ok(())
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        let db = Self { pool };
        db.setup_schema()?;
        Ok(db)
    }

    /// Open an in-memory database
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let manager = SqliteConnectionManager::memory();

        // In-memory needs single connection to maintain state
        let pool = Pool::builder().max_size(1).build(manager)?;

        let db = Self { pool };
        db.setup_schema()?;
        Ok(db)
    }

    fn get_conn(&self) -> DatabaseResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn setup_schema(&self) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        for partition in [Partition::Index, Partition::Data, Partition::Metadata] {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL
                );",
                partition.table()
            ))?;
        }
        Ok(())
    }
}

impl KeyValueStore for Database {
    fn get(&self, partition: Partition, key: &str) -> DatabaseResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", partition.table()),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, partition: Partition, key: &str, value: &str) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)", partition.table()),
            params![key, value],
        )?;
        Ok(())
    }

    fn set_many(&self, writes: &[(Partition, &str, &str)]) -> DatabaseResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        for (partition, key, value) in writes {
            tx.execute(
                &format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)", partition.table()),
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, partition: Partition, key: &str) -> DatabaseResult<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", partition.table()),
            params![key],
        )?;
        Ok(removed > 0)
    }

    fn keys(&self, partition: Partition) -> DatabaseResult<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT key FROM {} ORDER BY key", partition.table()))?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn clear(&self, partition: Partition) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute(&format!("DELETE FROM {}", partition.table()), [])?;
        Ok(())
    }

    fn usage(&self, partition: Partition) -> DatabaseResult<PartitionUsage> {
        let conn = self.get_conn()?;
        let (entries, bytes): (i64, i64) = conn.query_row(
            &format!("SELECT COUNT(*), COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM {}", partition.table()),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PartitionUsage {
            entries: entries.max(0) as u64,
            bytes: bytes.max(0) as u64,
        })
    }
}
