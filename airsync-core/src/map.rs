//! Client-originated change log: the generic `map` and the mail-specific
//! `mailmap`.
//!
//! Every change a client pushes during a sync cycle is appended here,
//! keyed by (device, user, folder, sync key, uid). On the next export
//! cycle the log answers two questions: has the client already seen this
//! change (loop suppression), and has the client already sent this Add
//! (retry dedup). Rows are only fresh for the current and previous
//! generation of a series and are collected aggressively.

use crate::models::{ChangeType, MessageFlags, SyncChange};
use crate::synckey::SyncKey;
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

/// Scope shared by every map operation: whose change log to consult.
#[derive(Debug, Clone, Copy)]
pub struct MapContext<'a> {
    pub device: &'a str,
    pub user: &'a str,
    pub folder: &'a str,
}

/// Which recorded mailmap rows agree with a candidate export change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailMapMatch {
    pub flags: bool,
    pub delete: bool,
    pub change: bool,
    pub draft: bool,
}

/// Digest of the concatenated category strings, stored instead of the
/// categories themselves.
pub fn category_digest(categories: &[String]) -> String {
    let mut hasher = Sha256::new();
    for category in categories {
        hasher.update(category.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Append one client-originated change to the generic `map`.
pub fn record_change(
    conn: &Connection,
    ctx: MapContext<'_>,
    sync_key: &SyncKey,
    change: &SyncChange,
) -> Result<()> {
    conn.execute(
        "INSERT INTO map (message_uid, sync_modtime, sync_key, sync_devid,
                          sync_folderid, sync_user, sync_clientid, sync_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            change.server_id,
            change.modtime,
            sync_key.to_string(),
            ctx.device,
            ctx.folder,
            ctx.user,
            change.client_id,
            change.change_type == ChangeType::Delete,
        ],
    )?;
    Ok(())
}

/// Append one client-originated email change to `mailmap`, populating
/// exactly the column matching the incoming change.
pub fn record_mail_change(
    conn: &Connection,
    ctx: MapContext<'_>,
    sync_key: &SyncKey,
    change: &SyncChange,
) -> Result<()> {
    let mut read: Option<bool> = None;
    let mut flagged: Option<bool> = None;
    let mut deleted: Option<bool> = None;
    let mut changed: Option<bool> = None;
    let mut category: Option<String> = None;
    let mut draft: Option<bool> = None;

    match change.change_type {
        ChangeType::Delete => deleted = Some(true),
        ChangeType::Flags => {
            let flags = change.flags.as_ref().ok_or_else(|| {
                Error::InvariantViolation("flags change without flag payload".to_string())
            })?;
            if let Some(value) = flags.read {
                read = Some(value);
            } else if let Some(value) = flags.flagged {
                flagged = Some(value);
            } else if let Some(value) = flags.draft {
                draft = Some(value);
            } else if let Some(categories) = &flags.categories {
                category = Some(category_digest(categories));
            } else {
                return Err(Error::InvariantViolation(
                    "flags change without flag payload".to_string(),
                ));
            }
        }
        ChangeType::Add | ChangeType::Change => changed = Some(true),
    }

    conn.execute(
        "INSERT INTO mailmap (message_uid, sync_key, sync_devid, sync_folderid, sync_user,
                              sync_read, sync_flagged, sync_deleted, sync_changed,
                              sync_category, sync_draft)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            change.server_id,
            sync_key.to_string(),
            ctx.device,
            ctx.folder,
            ctx.user,
            read,
            flagged,
            deleted,
            changed,
            category,
            draft,
        ],
    )?;
    Ok(())
}

/// The server uid previously assigned to an Add the client tagged with
/// `client_id`, if that Add already went through. Lets the server answer
/// a retried Add idempotently.
pub fn is_duplicate_addition(
    conn: &Connection,
    ctx: MapContext<'_>,
    client_id: &str,
) -> Result<Option<String>> {
    let uid: Option<String> = conn
        .query_row(
            "SELECT message_uid FROM map
             WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3
               AND sync_clientid = ?4
             ORDER BY sync_modtime DESC",
            rusqlite::params![ctx.device, ctx.user, ctx.folder, client_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(uid)
}

/// True iff `uid` already has a map row under `sync_key` (the client
/// already saw its own change applied).
pub fn is_duplicate_change(
    conn: &Connection,
    ctx: MapContext<'_>,
    uid: &str,
    sync_key: &SyncKey,
) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM map
            WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3
              AND message_uid = ?4 AND sync_key = ?5)",
        rusqlite::params![ctx.device, ctx.user, ctx.folder, uid, sync_key.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Cheap probe to skip loop suppression entirely when the log is empty
/// for this scope. Email always consults the mailmap.
pub fn has_pim_changes(conn: &Connection, ctx: MapContext<'_>, is_email: bool) -> Result<bool> {
    if is_email {
        return Ok(true);
    }
    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM map
            WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3)",
        rusqlite::params![ctx.device, ctx.user, ctx.folder],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// For each candidate uid, the max recorded modtime of a map row under
/// the current or immediately preceding generation of the series. Callers
/// drop any candidate whose server modtime is not newer: the client
/// already holds that state.
///
/// Delete candidates only match rows recorded as deletions.
pub fn pim_change_timestamps(
    conn: &Connection,
    ctx: MapContext<'_>,
    current: &SyncKey,
    changes: &[SyncChange],
) -> Result<BTreeMap<String, i64>> {
    let current_key = current.to_string();
    let previous_key = current.previous().map(|k| k.to_string()).unwrap_or_default();

    let mut timestamps = BTreeMap::new();
    for change in changes {
        let require_deleted = change.change_type == ChangeType::Delete;
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(sync_modtime) FROM map
             WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3
               AND message_uid = ?4 AND sync_key IN (?5, ?6)
               AND (?7 = 0 OR sync_deleted = 1)",
            rusqlite::params![
                ctx.device,
                ctx.user,
                ctx.folder,
                change.server_id,
                current_key,
                previous_key,
                require_deleted,
            ],
            |row| row.get(0),
        )?;
        if let Some(ts) = ts {
            timestamps.insert(change.server_id.clone(), ts);
        }
    }

    Ok(timestamps)
}

/// For each candidate uid, whether the recorded mailmap rows under the
/// current or previous generation agree with the candidate change.
/// Callers drop agreements: the client is the author of that state.
pub fn mailmap_changes(
    conn: &Connection,
    ctx: MapContext<'_>,
    current: &SyncKey,
    changes: &[SyncChange],
) -> Result<BTreeMap<String, MailMapMatch>> {
    let current_key = current.to_string();
    let previous_key = current.previous().map(|k| k.to_string()).unwrap_or_default();

    let mut matches = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT sync_read, sync_flagged, sync_deleted, sync_changed, sync_category, sync_draft
         FROM mailmap
         WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3
           AND message_uid = ?4 AND sync_key IN (?5, ?6)",
    )?;

    for change in changes {
        let rows: Vec<(
            Option<bool>,
            Option<bool>,
            Option<bool>,
            Option<bool>,
            Option<String>,
            Option<bool>,
        )> = stmt
            .query_map(
                rusqlite::params![
                    ctx.device,
                    ctx.user,
                    ctx.folder,
                    change.server_id,
                    current_key,
                    previous_key,
                ],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            continue;
        }

        let mut matched = MailMapMatch::default();
        let empty = MessageFlags::default();
        let flags = change.flags.as_ref().unwrap_or(&empty);

        for (read, flagged, deleted, changed, category, draft) in rows {
            match change.change_type {
                ChangeType::Flags => {
                    if read.is_some() && read == flags.read {
                        matched.flags = true;
                    }
                    if flagged.is_some() && flagged == flags.flagged {
                        matched.flags = true;
                    }
                    if let (Some(recorded), Some(candidate)) = (&category, &flags.categories) {
                        if *recorded == category_digest(candidate) {
                            matched.flags = true;
                        }
                    }
                    if draft.is_some() && draft == flags.draft {
                        matched.draft = true;
                    }
                }
                ChangeType::Delete => {
                    if deleted == Some(true) {
                        matched.delete = true;
                    }
                }
                ChangeType::Add | ChangeType::Change => {
                    if changed == Some(true) {
                        matched.change = true;
                    }
                    if draft.is_some() && draft == flags.draft {
                        matched.draft = true;
                    }
                }
            }
        }

        if matched != MailMapMatch::default() {
            matches.insert(change.server_id.clone(), matched);
        }
    }

    Ok(matches)
}

/// Delete every map and mailmap row of one collection, as a state reset
/// does.
pub fn delete_maps_for_collection(conn: &Connection, ctx: MapContext<'_>) -> Result<u32> {
    let mut removed = 0;
    for table in ["map", "mailmap"] {
        removed += conn.execute(
            &format!(
                "DELETE FROM {} WHERE sync_devid = ?1 AND sync_user = ?2 AND sync_folderid = ?3",
                table
            ),
            rusqlite::params![ctx.device, ctx.user, ctx.folder],
        )?;
    }
    Ok(removed as u32)
}

/// Generation GC for map and mailmap rows of `(device, user)` against the
/// current key `{G,N}`: drop same-series rows older than `N`. Maps only
/// drive loop suppression one generation back, so unlike state rows the
/// previous generation is the oldest kept.
pub fn gc_maps(conn: &Connection, device: &str, user: &str, current: &SyncKey) -> Result<u32> {
    let mut removed = 0;
    for table in ["map", "mailmap"] {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT sync_key FROM {} WHERE sync_devid = ?1 AND sync_user = ?2",
            table
        ))?;
        let keys: Vec<String> = stmt
            .query_map(rusqlite::params![device, user], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for key in keys {
            let stale = match SyncKey::parse(&key) {
                Ok(parsed) => parsed.same_series(current) && parsed.counter() < current.counter(),
                Err(_) => false,
            };
            if stale {
                removed += conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE sync_key = ?1 AND sync_devid = ?2 AND sync_user = ?3",
                        table
                    ),
                    rusqlite::params![key, device, user],
                )?;
            }
        }
    }

    if removed > 0 {
        debug!(device, user, removed, "map GC");
    }
    Ok(removed as u32)
}
