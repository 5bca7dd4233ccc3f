//! Per-(device, user) sync cache: the resumable context behind long-poll
//! requests.
//!
//! A suspended PING or loop-SYNC picks its folder list, per-collection
//! options and confirmed sync keys back up from here. An absent row reads
//! as the zero-value cache.

use crate::models::ContentClass;
use crate::snapshot::{decode_blob, encode_blob};
use crate::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One folder as remembered by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFolder {
    pub class: ContentClass,
    pub parent: String,
    pub display_name: String,
    pub folder_type: u32,
}

/// Per-collection option block sent by the client and replayed on resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    pub class: Option<ContentClass>,
    pub filter_type: Option<u32>,
    pub window_size: Option<u32>,
    pub conflict: Option<u32>,
    pub deletes_as_moves: Option<bool>,
    pub mime_support: Option<u32>,
}

/// The cached context of one (device, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCache {
    pub confirmed_synckeys: BTreeSet<String>,
    pub last_hb_sync_started: Option<i64>,
    pub last_sync_end_normal: Option<i64>,
    /// Persisted in string form; stamped on every save.
    pub timestamp: String,
    /// Client wait, in minutes.
    pub wait: Option<u32>,
    /// Heartbeat interval, in seconds.
    pub hb_interval: Option<u32>,
    /// Folder list fingerprint, keyed by server id.
    pub folders: BTreeMap<String, CachedFolder>,
    /// Hierarchy sync key, `"0"` when no hierarchy state exists.
    pub hierarchy: String,
    pub collections: BTreeMap<String, CollectionOptions>,
    pub ping_heartbeat: Option<u32>,
    /// Last issued generation per collection.
    pub synckey_counter: BTreeMap<String, u64>,
}

impl Default for SyncCache {
    fn default() -> Self {
        Self {
            confirmed_synckeys: BTreeSet::new(),
            last_hb_sync_started: None,
            last_sync_end_normal: None,
            timestamp: "0".to_string(),
            wait: None,
            hb_interval: None,
            folders: BTreeMap::new(),
            hierarchy: "0".to_string(),
            collections: BTreeMap::new(),
            ping_heartbeat: None,
            synckey_counter: BTreeMap::new(),
        }
    }
}

/// Cache fields selectable by [`get_fields`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheField {
    ConfirmedSynckeys,
    LastHbSyncStarted,
    LastSyncEndNormal,
    Timestamp,
    Wait,
    HbInterval,
    Folders,
    Hierarchy,
    Collections,
    PingHeartbeat,
    SynckeyCounter,
}

impl SyncCache {
    /// Mark a long-poll as opened.
    pub fn start_heartbeat(&mut self, now: i64) {
        self.last_hb_sync_started = Some(now);
    }

    /// Mark a long-poll response as delivered.
    pub fn end_heartbeat_normal(&mut self, now: i64) {
        self.last_sync_end_normal = Some(now);
    }

    /// Whether the last long-poll never ended normally. The next request
    /// must treat folder and collection lists as potentially stale.
    pub fn heartbeat_interrupted(&self) -> bool {
        match (self.last_hb_sync_started, self.last_sync_end_normal) {
            (Some(started), Some(ended)) => started > ended,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Record a sync key the client has acknowledged.
    pub fn confirm_sync_key(&mut self, key: &str) {
        self.confirmed_synckeys.insert(key.to_string());
    }

    /// Whether the client acknowledged this sync key.
    pub fn is_confirmed(&self, key: &str) -> bool {
        self.confirmed_synckeys.contains(key)
    }

    /// Forget one collection: options, issued-key counter, folder entry.
    pub fn remove_collection(&mut self, id: &str) {
        self.collections.remove(id);
        self.synckey_counter.remove(id);
        self.folders.remove(id);
    }

    /// Forget the entire hierarchy: folder list, collections, hierarchy
    /// key. The next folder sync starts from scratch.
    pub fn clear_hierarchy(&mut self) {
        self.folders.clear();
        self.collections.clear();
        self.hierarchy = "0".to_string();
    }

    fn project(&self, fields: &[CacheField]) -> SyncCache {
        let mut out = SyncCache::default();
        for field in fields {
            match field {
                CacheField::ConfirmedSynckeys => {
                    out.confirmed_synckeys = self.confirmed_synckeys.clone()
                }
                CacheField::LastHbSyncStarted => {
                    out.last_hb_sync_started = self.last_hb_sync_started
                }
                CacheField::LastSyncEndNormal => {
                    out.last_sync_end_normal = self.last_sync_end_normal
                }
                CacheField::Timestamp => out.timestamp = self.timestamp.clone(),
                CacheField::Wait => out.wait = self.wait,
                CacheField::HbInterval => out.hb_interval = self.hb_interval,
                CacheField::Folders => out.folders = self.folders.clone(),
                CacheField::Hierarchy => out.hierarchy = self.hierarchy.clone(),
                CacheField::Collections => out.collections = self.collections.clone(),
                CacheField::PingHeartbeat => out.ping_heartbeat = self.ping_heartbeat,
                CacheField::SynckeyCounter => {
                    out.synckey_counter = self.synckey_counter.clone()
                }
            }
        }
        out
    }
}

/// Load the cache for `(device, user)`, or the zero-value cache if no row
/// exists.
pub fn get(conn: &Connection, device: &str, user: &str) -> Result<SyncCache> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT cache_data FROM cache WHERE cache_devid = ?1 AND cache_user = ?2",
            rusqlite::params![device, user],
            |row| row.get(0),
        )
        .optional()?;

    match blob {
        Some(blob) if !blob.is_empty() => decode_blob(&blob),
        _ => Ok(SyncCache::default()),
    }
}

/// Load the cache restricted to the requested fields; everything else is
/// left at its zero value.
pub fn get_fields(
    conn: &Connection,
    device: &str,
    user: &str,
    fields: &[CacheField],
) -> Result<SyncCache> {
    Ok(get(conn, device, user)?.project(fields))
}

/// Upsert the cache for `(device, user)`, stamping its timestamp first.
pub fn save(conn: &Connection, cache: &mut SyncCache, device: &str, user: &str) -> Result<()> {
    cache.timestamp = Utc::now().timestamp().to_string();
    let blob = encode_blob(cache)?;

    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cache WHERE cache_devid = ?1 AND cache_user = ?2",
        rusqlite::params![device, user],
        |row| row.get(0),
    )?;

    if count == 0 {
        conn.execute(
            "INSERT INTO cache (cache_devid, cache_user, cache_data) VALUES (?1, ?2, ?3)",
            rusqlite::params![device, user, blob],
        )?;
    } else {
        conn.execute(
            "UPDATE cache SET cache_data = ?1 WHERE cache_devid = ?2 AND cache_user = ?3",
            rusqlite::params![blob, device, user],
        )?;
    }

    Ok(())
}

/// Delete cache rows matching the non-empty arguments. With no arguments
/// every row goes.
pub fn delete(conn: &Connection, device: Option<&str>, user: Option<&str>) -> Result<u32> {
    let deleted = match (device, user) {
        (Some(device), Some(user)) => conn.execute(
            "DELETE FROM cache WHERE cache_devid = ?1 AND cache_user = ?2",
            rusqlite::params![device, user],
        )?,
        (Some(device), None) => conn.execute(
            "DELETE FROM cache WHERE cache_devid = ?1",
            [device],
        )?,
        (None, Some(user)) => conn.execute(
            "DELETE FROM cache WHERE cache_user = ?1",
            [user],
        )?,
        (None, None) => conn.execute("DELETE FROM cache", [])?,
    };
    Ok(deleted as u32)
}
