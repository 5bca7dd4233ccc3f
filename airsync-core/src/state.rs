//! State-row operations: fetch, replace-save, stamp refresh, server-id
//! rewrite, and generation garbage collection.

use crate::database::models::StateRow;
use crate::snapshot::{self, SyncData};
use crate::synckey::SyncKey;
use crate::Result;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

/// Fetch the state row for `sync_key`, optionally restricted to one
/// collection. Returns `None` when no matching row exists (the caller
/// turns this into a key-mismatch answer).
pub fn fetch_state(
    conn: &Connection,
    sync_key: &SyncKey,
    folder: Option<&str>,
) -> Result<Option<StateRow>> {
    let key = sync_key.to_string();
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<StateRow> {
        Ok(StateRow {
            sync_key: row.get(0)?,
            sync_data: row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
            device_id: row.get(2)?,
            folder_id: row.get(3)?,
            user: row.get(4)?,
            sync_mod: row.get(5)?,
            sync_pending: row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default(),
            sync_timestamp: row.get(7)?,
        })
    };

    let row = match folder {
        Some(folder) => conn
            .query_row(
                "SELECT sync_key, sync_data, sync_devid, sync_folderid, sync_user,
                        sync_mod, sync_pending, sync_timestamp
                 FROM state WHERE sync_key = ?1 AND sync_folderid = ?2",
                rusqlite::params![key, folder],
                map_row,
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT sync_key, sync_data, sync_devid, sync_folderid, sync_user,
                        sync_mod, sync_pending, sync_timestamp
                 FROM state WHERE sync_key = ?1",
                [&key],
                map_row,
            )
            .optional()?,
    };

    Ok(row)
}

/// Persist a state row with replace semantics: delete any previous row
/// with the same sync key, then insert, inside one transaction. A retried
/// request that saved half-way is overwritten cleanly.
pub fn save_state(conn: &mut Connection, row: &StateRow) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM state WHERE sync_key = ?1", [&row.sync_key])?;
    tx.execute(
        "INSERT INTO state (sync_key, sync_data, sync_devid, sync_folderid, sync_user,
                            sync_mod, sync_pending, sync_timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            row.sync_key,
            row.sync_data,
            row.device_id,
            row.folder_id,
            row.user,
            row.sync_mod,
            row.sync_pending,
            row.sync_timestamp,
        ],
    )?;
    tx.commit()?;
    Ok(())
}

/// Stamp-only refresh of the current row, guarded by the old stamp for
/// optimistic concurrency. Returns whether this caller won the update.
pub fn update_sync_stamp(
    conn: &Connection,
    sync_key: &SyncKey,
    old_stamp: i64,
    new_stamp: i64,
    now: i64,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE state SET sync_mod = ?1, sync_timestamp = ?2
         WHERE sync_key = ?3 AND sync_mod = ?4",
        rusqlite::params![new_stamp, now, sync_key.to_string(), old_stamp],
    )?;
    Ok(changed == 1)
}

/// Rewrite the embedded backend server id in every state row of
/// `(device, user, folder_uid)`. Returns the number of rows rewritten.
pub fn update_server_id(
    conn: &Connection,
    device: &str,
    user: &str,
    folder_uid: &str,
    new_server_id: &str,
) -> Result<u32> {
    let mut stmt = conn.prepare(
        "SELECT sync_key, sync_data FROM state
         WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3",
    )?;
    let rows: Vec<(String, Option<Vec<u8>>)> = stmt
        .query_map(rusqlite::params![device, user, folder_uid], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut rewritten = 0;
    for (key, blob) in rows {
        let blob = match blob {
            Some(blob) if !blob.is_empty() => blob,
            _ => continue,
        };
        let mut data: SyncData = snapshot::decode_blob(&blob)?;
        data.update_server_id(folder_uid, new_server_id);
        conn.execute(
            "UPDATE state SET sync_data = ?1 WHERE sync_key = ?2",
            rusqlite::params![snapshot::encode_blob(&data)?, key],
        )?;
        rewritten += 1;
    }

    Ok(rewritten)
}

/// Delete every state row of `(device, user, folder)`.
pub fn delete_states_for_collection(
    conn: &Connection,
    device: &str,
    user: &str,
    folder: &str,
) -> Result<u32> {
    let deleted = conn.execute(
        "DELETE FROM state
         WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3",
        rusqlite::params![device, user, folder],
    )?;
    Ok(deleted as u32)
}

/// The most recently saved sync key for `(device, user, folder)`.
pub fn latest_sync_key_for_collection(
    conn: &Connection,
    device: &str,
    user: &str,
    folder: &str,
) -> Result<Option<SyncKey>> {
    let mut stmt = conn.prepare(
        "SELECT sync_key FROM state
         WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3
         ORDER BY sync_timestamp DESC",
    )?;
    let keys: Vec<String> = stmt
        .query_map(rusqlite::params![device, user, folder], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(keys.iter().find_map(|k| SyncKey::parse(k).ok()))
}

/// Max `sync_timestamp` over all state rows of `(device, user)`.
pub fn last_sync_timestamp(conn: &Connection, device: &str, user: &str) -> Result<Option<i64>> {
    let ts: Option<i64> = conn.query_row(
        "SELECT MAX(sync_timestamp) FROM state WHERE sync_devid = ?1 AND sync_user = ?2",
        rusqlite::params![device, user],
        |row| row.get(0),
    )?;
    Ok(ts)
}

/// Generation GC for state rows of `(device, user, folder)` against the
/// current key `{G,N}`: drop same-series rows older than `N-1`, and any
/// row whose key no longer parses. Keeping `N-1` lets a client that never
/// received `{G,N}` re-present the previous key and still succeed.
pub fn gc_states(
    conn: &Connection,
    device: &str,
    user: &str,
    folder: &str,
    current: &SyncKey,
) -> Result<u32> {
    let mut stmt = conn.prepare(
        "SELECT sync_key FROM state
         WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3",
    )?;
    let keys: Vec<String> = stmt
        .query_map(rusqlite::params![device, user, folder], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut removed = 0;
    for key in keys {
        let stale = match SyncKey::parse(&key) {
            Ok(parsed) => {
                parsed.same_series(current) && parsed.counter() + 1 < current.counter()
            }
            // Residue from a series the store no longer understands.
            Err(_) => true,
        };
        if stale {
            removed += conn.execute(
                "DELETE FROM state
                 WHERE sync_key = ?1 AND sync_devid = ?2 AND sync_user = ?3
                   AND sync_folderid = ?4",
                rusqlite::params![key, device, user, folder],
            )?;
        }
    }

    if removed > 0 {
        debug!(device, user, folder, removed, "state GC");
    }
    Ok(removed as u32)
}
