//! Database schema and connection management.
//!
//! Six logical tables back the whole engine: `state` (per-sync-key
//! snapshots), `map` and `mailmap` (client-originated change log),
//! `device` and `device_user` (device registry and policy keys), and
//! `cache` (per-(device,user) long-poll context). Column names are part
//! of the deployed on-disk format and must not change.

use crate::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a database lives; needed to reopen a handle after `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// Main database connection and schema manager
pub struct Database {
    conn: Connection,
    location: StoreLocation,
}

impl Database {
    /// Open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // Parallel requests each hold their own handle; writes contend.
        conn.busy_timeout(Duration::from_secs(10))?;

        Ok(Self {
            conn,
            location: StoreLocation::File(path.as_ref().to_path_buf()),
        })
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        Ok(Self {
            conn,
            location: StoreLocation::Memory,
        })
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_state_table()?;
        self.create_map_table()?;
        self.create_mailmap_table()?;
        self.create_device_table()?;
        self.create_device_user_table()?;
        self.create_cache_table()?;
        Ok(())
    }

    fn create_state_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                sync_key TEXT PRIMARY KEY,
                sync_data BLOB,
                sync_devid TEXT NOT NULL,
                sync_folderid TEXT NOT NULL,
                sync_user TEXT NOT NULL,
                sync_mod INTEGER NOT NULL DEFAULT 0,
                sync_pending BLOB,
                sync_timestamp INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_state_scope
                ON state(sync_devid, sync_user, sync_folderid)",
            [],
        )?;
        Ok(())
    }

    fn create_map_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS map (
                message_uid TEXT NOT NULL,
                sync_modtime INTEGER NOT NULL,
                sync_key TEXT NOT NULL,
                sync_devid TEXT NOT NULL,
                sync_folderid TEXT NOT NULL,
                sync_user TEXT NOT NULL,
                sync_clientid TEXT,
                sync_deleted INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_map_scope
                ON map(sync_devid, sync_user, sync_folderid, message_uid)",
            [],
        )?;
        Ok(())
    }

    fn create_mailmap_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS mailmap (
                message_uid TEXT NOT NULL,
                sync_key TEXT NOT NULL,
                sync_devid TEXT NOT NULL,
                sync_folderid TEXT NOT NULL,
                sync_user TEXT NOT NULL,
                sync_read INTEGER,
                sync_flagged INTEGER,
                sync_deleted INTEGER,
                sync_changed INTEGER,
                sync_category TEXT,
                sync_draft INTEGER
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_mailmap_scope
                ON mailmap(sync_devid, sync_user, sync_folderid, message_uid)",
            [],
        )?;
        Ok(())
    }

    fn create_device_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS device (
                device_id TEXT PRIMARY KEY,
                device_type TEXT NOT NULL DEFAULT '',
                device_agent TEXT NOT NULL DEFAULT '',
                device_rwstatus TEXT NOT NULL DEFAULT 'na',
                device_supported BLOB,
                device_properties BLOB
            )",
            [],
        )?;
        Ok(())
    }

    fn create_device_user_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS device_user (
                device_id TEXT NOT NULL,
                device_user TEXT NOT NULL,
                device_policykey INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (device_id, device_user)
            )",
            [],
        )?;
        Ok(())
    }

    fn create_cache_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS cache (
                cache_devid TEXT NOT NULL,
                cache_user TEXT NOT NULL,
                cache_data BLOB,
                PRIMARY KEY (cache_devid, cache_user)
            )",
            [],
        )?;
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable connection access, required for explicit transactions
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Where this database lives
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Reopen a handle to the same store. Fails for in-memory databases,
    /// whose contents die with the connection.
    pub fn reopen(location: &StoreLocation) -> Result<Self> {
        match location {
            StoreLocation::File(path) => Self::open(path),
            StoreLocation::Memory => Err(Error::InvariantViolation(
                "an in-memory store cannot be reopened".to_string(),
            )),
        }
    }
}
