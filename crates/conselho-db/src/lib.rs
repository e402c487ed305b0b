pub mod consultations;
pub mod ledger;
pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::{Result, bail};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

const READER_POOL_SIZE: usize = 4;

/// How long a connection waits on another writer's lock before giving up.
/// Other processes (payment webhook, admin tools) share the same file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database with a reader/writer split.
///
/// All writes go through the single writer connection; ledger writes
/// additionally take SQLite's database write lock with `BEGIN IMMEDIATE`, so
/// they serialize against writers in other processes as well.
pub struct Database {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_idx: AtomicUsize,
}

impl Database {
    /// Open an already-migrated database. Fails if the schema is behind;
    /// migrations are applied separately with [`migrate`].
    pub fn open(path: &Path) -> Result<Self> {
        let writer = Connection::open(path)?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        writer.busy_timeout(BUSY_TIMEOUT)?;

        let version = migrations::current_version(&writer)?;
        if version != migrations::LATEST_VERSION {
            bail!(
                "database schema is at v{}, expected v{}; run conselho-migrate first",
                version,
                migrations::LATEST_VERSION
            );
        }

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            readers.push(Mutex::new(conn));
        }

        info!(
            "Database opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        // A panic inside another closure leaves the connection usable; any
        // open transaction was rolled back when it unwound.
        let conn = self.readers[idx].lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut conn)
    }
}

/// Apply all pending schema migrations to the database at `path`.
/// Returns the resulting schema version.
pub fn migrate(path: &Path) -> Result<u32> {
    let mut conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    migrations::run(&mut conn)
}
