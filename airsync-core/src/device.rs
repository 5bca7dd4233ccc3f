//! Device registry: per-device metadata, per-(device, user) policy keys,
//! remote-wipe lifecycle, and multi-mode state removal.

use crate::cache;
use crate::models::RemoteWipeStatus;
use crate::snapshot::{decode_blob, encode_blob};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Per-device metadata. `supported` is immutable once nonempty;
/// `properties` is updated on every sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_type: String,
    pub user_agent: String,
    pub rw_status: RemoteWipeStatus,
    pub supported: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

/// One row of a device listing: the device joined with one of its users.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceListEntry {
    pub device_id: String,
    pub device_type: String,
    pub user_agent: String,
    pub rw_status: RemoteWipeStatus,
    pub user: String,
    pub policy_key: i64,
    pub last_sync: Option<i64>,
}

/// LIKE filters for [`list_devices`], restricted to a closed field set.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub user_agent: Option<String>,
    pub user: Option<String>,
}

/// Scope selector for [`remove_state`].
#[derive(Debug, Clone, Default)]
pub struct RemoveStateOptions {
    pub device: Option<String>,
    pub user: Option<String>,
    pub collection: Option<String>,
    pub sync_key: Option<String>,
}

fn decode_string_list(blob: Option<Vec<u8>>) -> Result<Vec<String>> {
    match blob {
        Some(blob) if !blob.is_empty() => decode_blob(&blob),
        _ => Ok(Vec::new()),
    }
}

fn decode_string_map(blob: Option<Vec<u8>>) -> Result<BTreeMap<String, String>> {
    match blob {
        Some(blob) if !blob.is_empty() => decode_blob(&blob),
        _ => Ok(BTreeMap::new()),
    }
}

/// Load a device row, and with `user` also its policy key. Fails with
/// `DeviceNotFound` for an unknown id; the caller decides whether to
/// provision or reject.
pub fn load_device(
    conn: &Connection,
    id: &str,
    user: Option<&str>,
) -> Result<(DeviceRecord, Option<i64>)> {
    let record = conn
        .query_row(
            "SELECT device_id, device_type, device_agent, device_rwstatus,
                    device_supported, device_properties
             FROM device WHERE device_id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                    row.get::<_, Option<Vec<u8>>>(5)?,
                ))
            },
        )
        .optional()?;

    let (device_id, device_type, user_agent, rw_status, supported, properties) =
        record.ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;

    let record = DeviceRecord {
        device_id,
        device_type,
        user_agent,
        rw_status: RemoteWipeStatus::parse(&rw_status),
        supported: decode_string_list(supported)?,
        properties: decode_string_map(properties)?,
    };

    let policy_key = match user {
        Some(user) => conn
            .query_row(
                "SELECT device_policykey FROM device_user
                 WHERE device_id = ?1 AND device_user = ?2",
                rusqlite::params![id, user],
                |row| row.get(0),
            )
            .optional()?,
        None => None,
    };

    Ok((record, policy_key))
}

/// The policy key of one (device, user) pairing, if the pairing exists.
pub fn get_policy_key(conn: &Connection, device: &str, user: &str) -> Result<Option<i64>> {
    let key = conn
        .query_row(
            "SELECT device_policykey FROM device_user
             WHERE device_id = ?1 AND device_user = ?2",
            rusqlite::params![device, user],
            |row| row.get(0),
        )
        .optional()?;
    Ok(key)
}

/// Insert or update a device row. On update only `user_agent`,
/// `properties`, and a first nonempty `supported` are written; a
/// nonempty stored `supported` is never replaced. With `user` given, a
/// `(device, user)` pairing row is ensured.
pub fn set_device(conn: &Connection, record: &DeviceRecord, user: Option<&str>) -> Result<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM device WHERE device_id = ?1",
        [&record.device_id],
        |row| row.get(0),
    )?;

    if count == 0 {
        conn.execute(
            "INSERT INTO device (device_id, device_type, device_agent, device_rwstatus,
                                 device_supported, device_properties)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.device_id,
                record.device_type,
                record.user_agent,
                record.rw_status.as_str(),
                encode_blob(&record.supported)?,
                encode_blob(&record.properties)?,
            ],
        )?;
        info!(device = %record.device_id, "registered new device");
    } else {
        let stored_supported: Option<Vec<u8>> = conn.query_row(
            "SELECT device_supported FROM device WHERE device_id = ?1",
            [&record.device_id],
            |row| row.get(0),
        )?;
        let stored_supported = decode_string_list(stored_supported)?;

        if stored_supported.is_empty() && !record.supported.is_empty() {
            conn.execute(
                "UPDATE device SET device_agent = ?1, device_properties = ?2,
                                   device_supported = ?3
                 WHERE device_id = ?4",
                rusqlite::params![
                    record.user_agent,
                    encode_blob(&record.properties)?,
                    encode_blob(&record.supported)?,
                    record.device_id,
                ],
            )?;
        } else {
            if !stored_supported.is_empty()
                && !record.supported.is_empty()
                && stored_supported != record.supported
            {
                warn!(device = %record.device_id, "ignoring attempt to replace supported classes");
            }
            conn.execute(
                "UPDATE device SET device_agent = ?1, device_properties = ?2
                 WHERE device_id = ?3",
                rusqlite::params![
                    record.user_agent,
                    encode_blob(&record.properties)?,
                    record.device_id,
                ],
            )?;
        }
    }

    if let Some(user) = user {
        conn.execute(
            "INSERT OR IGNORE INTO device_user (device_id, device_user, device_policykey)
             VALUES (?1, ?2, 0)",
            rusqlite::params![record.device_id, user],
        )?;
    }

    Ok(())
}

/// Update only the mutable `properties` blob of a device.
pub fn set_device_properties(
    conn: &Connection,
    id: &str,
    properties: &BTreeMap<String, String>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE device SET device_properties = ?1 WHERE device_id = ?2",
        rusqlite::params![encode_blob(properties)?, id],
    )?;
    if changed == 0 {
        return Err(Error::DeviceNotFound(id.to_string()));
    }
    Ok(())
}

/// How many registry rows match: device rows for `id`, or pairing rows
/// for `(id, user)`. Zero means "unknown device".
pub fn device_exists(conn: &Connection, id: &str, user: Option<&str>) -> Result<u32> {
    let count: i64 = match user {
        Some(user) => conn.query_row(
            "SELECT COUNT(*) FROM device_user WHERE device_id = ?1 AND device_user = ?2",
            rusqlite::params![id, user],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM device WHERE device_id = ?1",
            [id],
            |row| row.get(0),
        )?,
    };
    Ok(count as u32)
}

/// Store the policy key for `(device, user)`.
pub fn set_policy_key(conn: &Connection, device: &str, user: &str, key: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO device_user (device_id, device_user, device_policykey)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(device_id, device_user) DO UPDATE SET
            device_policykey = excluded.device_policykey",
        rusqlite::params![device, user, key],
    )?;
    Ok(())
}

/// Zero every policy key, forcing all devices back through provisioning.
pub fn reset_all_policy_keys(conn: &Connection) -> Result<u32> {
    let changed = conn.execute("UPDATE device_user SET device_policykey = 0", [])?;
    info!(pairs = changed, "reset all policy keys");
    Ok(changed as u32)
}

/// Update a device's remote-wipe status. Arming a wipe (`Pending`) also
/// zeroes the device's policy keys so every user's next request is forced
/// through provisioning.
pub fn set_device_rw_status(
    conn: &Connection,
    device: &str,
    status: RemoteWipeStatus,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE device SET device_rwstatus = ?1 WHERE device_id = ?2",
        rusqlite::params![status.as_str(), device],
    )?;
    if changed == 0 {
        return Err(Error::DeviceNotFound(device.to_string()));
    }

    if status == RemoteWipeStatus::Pending {
        conn.execute(
            "UPDATE device_user SET device_policykey = 0 WHERE device_id = ?1",
            [device],
        )?;
        info!(device, "remote wipe pending, policy keys zeroed");
    }

    Ok(())
}

/// All (device, user) pairings matching the optional user and filters.
pub fn list_devices(
    conn: &Connection,
    user: Option<&str>,
    filter: &DeviceFilter,
) -> Result<Vec<DeviceListEntry>> {
    let mut sql = String::from(
        "SELECT d.device_id, d.device_type, d.device_agent, d.device_rwstatus,
                du.device_user, du.device_policykey,
                (SELECT MAX(sync_timestamp) FROM state
                 WHERE sync_devid = d.device_id AND sync_user = du.device_user)
         FROM device d
         JOIN device_user du ON d.device_id = du.device_id
         WHERE 1 = 1",
    );
    let mut params: Vec<String> = Vec::new();

    if let Some(user) = user {
        sql.push_str(&format!(" AND du.device_user = ?{}", params.len() + 1));
        params.push(user.to_string());
    }
    for (column, value) in [
        ("d.device_id", &filter.device_id),
        ("d.device_type", &filter.device_type),
        ("d.device_agent", &filter.user_agent),
        ("du.device_user", &filter.user),
    ] {
        if let Some(value) = value {
            sql.push_str(&format!(" AND {} LIKE ?{}", column, params.len() + 1));
            params.push(format!("%{}%", value));
        }
    }
    sql.push_str(" ORDER BY d.device_id, du.device_user");

    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(DeviceListEntry {
                device_id: row.get(0)?,
                device_type: row.get(1)?,
                user_agent: row.get(2)?,
                rw_status: RemoteWipeStatus::parse(&row.get::<_, String>(3)?),
                user: row.get(4)?,
                policy_key: row.get(5)?,
                last_sync: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Multi-mode deletion of sync state and registry rows.
///
/// - `{sync_key}`: state/map/mailmap rows under that key only.
/// - `{device, user, collection}`: state/map/mailmap for the collection,
///   plus its cache entry.
/// - `{device, user}`: state/map/mailmap and the pairing row and cache.
///   If the device is armed for wipe, the call escalates to full-device
///   removal so no armed device row lingers.
/// - `{device}`: everything the device owns, including the device row.
/// - `{user}`: everything the user owns on any device; devices left with
///   no users go too.
pub fn remove_state(conn: &Connection, opts: &RemoveStateOptions) -> Result<()> {
    if let Some(sync_key) = &opts.sync_key {
        for table in ["state", "map", "mailmap"] {
            conn.execute(
                &format!("DELETE FROM {} WHERE sync_key = ?1", table),
                [sync_key],
            )?;
        }
        return Ok(());
    }

    match (&opts.device, &opts.user) {
        (Some(device), Some(user)) => {
            let rw_status: Option<String> = conn
                .query_row(
                    "SELECT device_rwstatus FROM device WHERE device_id = ?1",
                    [device],
                    |row| row.get(0),
                )
                .optional()?;
            let armed = rw_status
                .map(|s| RemoteWipeStatus::parse(&s).wipe_armed())
                .unwrap_or(false);
            if armed {
                info!(device, "wipe armed, escalating removal to whole device");
                return remove_device(conn, device);
            }

            if let Some(collection) = &opts.collection {
                for table in ["state", "map", "mailmap"] {
                    conn.execute(
                        &format!(
                            "DELETE FROM {} WHERE sync_devid = ?1 AND sync_user = ?2
                               AND sync_folderid = ?3",
                            table
                        ),
                        rusqlite::params![device, user, collection],
                    )?;
                }
                let mut cached = cache::get(conn, device, user)?;
                cached.remove_collection(collection);
                cache::save(conn, &mut cached, device, user)?;
            } else {
                for table in ["state", "map", "mailmap"] {
                    conn.execute(
                        &format!(
                            "DELETE FROM {} WHERE sync_devid = ?1 AND sync_user = ?2",
                            table
                        ),
                        rusqlite::params![device, user],
                    )?;
                }
                conn.execute(
                    "DELETE FROM device_user WHERE device_id = ?1 AND device_user = ?2",
                    rusqlite::params![device, user],
                )?;
                cache::delete(conn, Some(device.as_str()), Some(user.as_str()))?;
            }
            Ok(())
        }
        (Some(device), None) => remove_device(conn, device),
        (None, Some(user)) => {
            for table in ["state", "map", "mailmap"] {
                conn.execute(
                    &format!("DELETE FROM {} WHERE sync_user = ?1", table),
                    [user],
                )?;
            }
            conn.execute("DELETE FROM device_user WHERE device_user = ?1", [user])?;
            cache::delete(conn, None, Some(user.as_str()))?;
            remove_orphan_devices(conn)?;
            Ok(())
        }
        (None, None) => Err(Error::InvariantViolation(
            "remove_state requires a device, user, or sync key scope".to_string(),
        )),
    }
}

fn remove_device(conn: &Connection, device: &str) -> Result<()> {
    for table in ["state", "map", "mailmap"] {
        conn.execute(
            &format!("DELETE FROM {} WHERE sync_devid = ?1", table),
            [device],
        )?;
    }
    conn.execute("DELETE FROM device_user WHERE device_id = ?1", [device])?;
    conn.execute("DELETE FROM device WHERE device_id = ?1", [device])?;
    cache::delete(conn, Some(device), None)?;
    info!(device, "removed device");
    Ok(())
}

fn remove_orphan_devices(conn: &Connection) -> Result<u32> {
    let removed = conn.execute(
        "DELETE FROM device WHERE device_id NOT IN (SELECT device_id FROM device_user)",
        [],
    )?;
    Ok(removed as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn setup() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    fn device(id: &str) -> DeviceRecord {
        DeviceRecord {
            device_id: id.to_string(),
            device_type: "phone".to_string(),
            user_agent: "Client/1.0".to_string(),
            rw_status: RemoteWipeStatus::NotApplicable,
            supported: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    fn seed_state(db: &Database, dev: &str, user: &str, folder: &str, key: &str) {
        db.conn()
            .execute(
                "INSERT INTO state (sync_key, sync_devid, sync_folderid, sync_user, sync_timestamp)
                 VALUES (?1, ?2, ?3, ?4, 100)",
                rusqlite::params![key, dev, folder, user],
            )
            .unwrap();
        db.conn()
            .execute(
                "INSERT INTO map (message_uid, sync_modtime, sync_key, sync_devid,
                                  sync_folderid, sync_user, sync_deleted)
                 VALUES ('u1', 1, ?1, ?2, ?3, ?4, 0)",
                rusqlite::params![key, dev, folder, user],
            )
            .unwrap();
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn unknown_device_fails() {
        let db = setup();
        assert!(matches!(
            load_device(db.conn(), "ghost", None),
            Err(Error::DeviceNotFound(_))
        ));
        assert_eq!(device_exists(db.conn(), "ghost", None).unwrap(), 0);
    }

    #[test]
    fn register_and_reload() {
        let db = setup();
        let mut rec = device("dev1");
        rec.properties.insert("os".to_string(), "14.1".to_string());
        set_device(db.conn(), &rec, Some("alice")).unwrap();

        let (loaded, policy_key) = load_device(db.conn(), "dev1", Some("alice")).unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(policy_key, Some(0));
        assert_eq!(device_exists(db.conn(), "dev1", Some("alice")).unwrap(), 1);
        assert_eq!(device_exists(db.conn(), "dev1", Some("bob")).unwrap(), 0);
    }

    #[test]
    fn supported_is_immutable_once_set() {
        let db = setup();
        let mut rec = device("dev1");
        set_device(db.conn(), &rec, Some("alice")).unwrap();

        // First nonempty write lands.
        rec.supported = vec!["Email".to_string(), "Contacts".to_string()];
        set_device(db.conn(), &rec, Some("alice")).unwrap();
        let (loaded, _) = load_device(db.conn(), "dev1", None).unwrap();
        assert_eq!(loaded.supported, rec.supported);

        // Replacement attempt is ignored.
        let mut replacement = rec.clone();
        replacement.supported = vec!["Calendar".to_string()];
        replacement.user_agent = "Client/2.0".to_string();
        set_device(db.conn(), &replacement, Some("alice")).unwrap();
        let (loaded, _) = load_device(db.conn(), "dev1", None).unwrap();
        assert_eq!(loaded.supported, rec.supported);
        assert_eq!(loaded.user_agent, "Client/2.0");
    }

    #[test]
    fn policy_key_lifecycle() {
        let db = setup();
        set_device(db.conn(), &device("dev1"), Some("alice")).unwrap();
        set_device(db.conn(), &device("dev1"), Some("bob")).unwrap();

        set_policy_key(db.conn(), "dev1", "alice", 12345).unwrap();
        let (_, key) = load_device(db.conn(), "dev1", Some("alice")).unwrap();
        assert_eq!(key, Some(12345));

        reset_all_policy_keys(db.conn()).unwrap();
        let (_, key) = load_device(db.conn(), "dev1", Some("alice")).unwrap();
        assert_eq!(key, Some(0));
    }

    #[test]
    fn pending_wipe_zeroes_policy_keys() {
        let db = setup();
        set_device(db.conn(), &device("dev1"), Some("alice")).unwrap();
        set_device(db.conn(), &device("dev1"), Some("bob")).unwrap();
        set_policy_key(db.conn(), "dev1", "alice", 111).unwrap();
        set_policy_key(db.conn(), "dev1", "bob", 222).unwrap();

        set_device_rw_status(db.conn(), "dev1", RemoteWipeStatus::Pending).unwrap();

        let (loaded, key) = load_device(db.conn(), "dev1", Some("alice")).unwrap();
        assert_eq!(loaded.rw_status, RemoteWipeStatus::Pending);
        assert_eq!(key, Some(0));
        let (_, key) = load_device(db.conn(), "dev1", Some("bob")).unwrap();
        assert_eq!(key, Some(0));
    }

    #[test]
    fn wiped_status_keeps_policy_keys() {
        let db = setup();
        set_device(db.conn(), &device("dev1"), Some("alice")).unwrap();
        set_policy_key(db.conn(), "dev1", "alice", 111).unwrap();

        set_device_rw_status(db.conn(), "dev1", RemoteWipeStatus::Wiped).unwrap();
        let (_, key) = load_device(db.conn(), "dev1", Some("alice")).unwrap();
        assert_eq!(key, Some(111));
    }

    #[test]
    fn list_devices_with_filters() {
        let db = setup();
        set_device(db.conn(), &device("android-1"), Some("alice")).unwrap();
        set_device(db.conn(), &device("iphone-2"), Some("alice")).unwrap();
        set_device(db.conn(), &device("iphone-2"), Some("bob")).unwrap();
        seed_state(&db, "iphone-2", "bob", "inbox", "{abc}1");

        let all = list_devices(db.conn(), None, &DeviceFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let alices = list_devices(db.conn(), Some("alice"), &DeviceFilter::default()).unwrap();
        assert_eq!(alices.len(), 2);

        let filter = DeviceFilter {
            device_id: Some("iphone".to_string()),
            ..Default::default()
        };
        let iphones = list_devices(db.conn(), None, &filter).unwrap();
        assert_eq!(iphones.len(), 2);
        assert!(iphones.iter().all(|e| e.device_id == "iphone-2"));

        let bobs = list_devices(db.conn(), Some("bob"), &DeviceFilter::default()).unwrap();
        assert_eq!(bobs[0].last_sync, Some(100));
    }

    #[test]
    fn remove_by_sync_key_only() {
        let db = setup();
        seed_state(&db, "dev1", "alice", "inbox", "{abc}1");
        seed_state(&db, "dev1", "alice", "inbox", "{abc}2");

        remove_state(
            db.conn(),
            &RemoveStateOptions {
                sync_key: Some("{abc}1".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(count(&db, "state"), 1);
        assert_eq!(count(&db, "map"), 1);
    }

    #[test]
    fn remove_device_user_pair() {
        let db = setup();
        set_device(db.conn(), &device("dev1"), Some("alice")).unwrap();
        set_device(db.conn(), &device("dev1"), Some("bob")).unwrap();
        seed_state(&db, "dev1", "alice", "inbox", "{abc}1");
        seed_state(&db, "dev1", "bob", "inbox", "{def}1");
        cache::save(db.conn(), &mut cache::SyncCache::default(), "dev1", "alice").unwrap();

        remove_state(
            db.conn(),
            &RemoveStateOptions {
                device: Some("dev1".to_string()),
                user: Some("alice".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        // Bob's rows and the device survive.
        assert_eq!(count(&db, "state"), 1);
        assert_eq!(count(&db, "device_user"), 1);
        assert_eq!(count(&db, "device"), 1);
        assert_eq!(count(&db, "cache"), 0);
    }

    #[test]
    fn remove_restricted_to_collection() {
        let db = setup();
        set_device(db.conn(), &device("dev1"), Some("alice")).unwrap();
        seed_state(&db, "dev1", "alice", "inbox", "{abc}1");
        seed_state(&db, "dev1", "alice", "contacts", "{def}1");

        let mut cached = cache::SyncCache::default();
        cached
            .collections
            .insert("inbox".to_string(), Default::default());
        cached.synckey_counter.insert("inbox".to_string(), 1);
        cache::save(db.conn(), &mut cached, "dev1", "alice").unwrap();

        remove_state(
            db.conn(),
            &RemoveStateOptions {
                device: Some("dev1".to_string()),
                user: Some("alice".to_string()),
                collection: Some("inbox".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(count(&db, "state"), 1);
        assert_eq!(count(&db, "device_user"), 1);
        let cached = cache::get(db.conn(), "dev1", "alice").unwrap();
        assert!(cached.collections.is_empty());
    }

    #[test]
    fn wipe_armed_escalates_to_device_removal() {
        let db = setup();
        set_device(db.conn(), &device("dev1"), Some("alice")).unwrap();
        set_device(db.conn(), &device("dev1"), Some("bob")).unwrap();
        seed_state(&db, "dev1", "alice", "inbox", "{abc}1");
        seed_state(&db, "dev1", "bob", "inbox", "{def}1");
        set_device_rw_status(db.conn(), "dev1", RemoteWipeStatus::Pending).unwrap();

        remove_state(
            db.conn(),
            &RemoveStateOptions {
                device: Some("dev1".to_string()),
                user: Some("alice".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        // The user restriction was dropped: nothing of the device is left.
        assert_eq!(count(&db, "state"), 0);
        assert_eq!(count(&db, "map"), 0);
        assert_eq!(count(&db, "device_user"), 0);
        assert_eq!(count(&db, "device"), 0);
    }

    #[test]
    fn remove_user_cleans_orphan_devices() {
        let db = setup();
        set_device(db.conn(), &device("dev1"), Some("alice")).unwrap();
        set_device(db.conn(), &device("dev2"), Some("alice")).unwrap();
        set_device(db.conn(), &device("dev2"), Some("bob")).unwrap();
        seed_state(&db, "dev1", "alice", "inbox", "{abc}1");
        seed_state(&db, "dev2", "alice", "inbox", "{def}1");

        remove_state(
            db.conn(),
            &RemoveStateOptions {
                user: Some("alice".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        // dev1 lost its only user; dev2 still serves bob.
        assert_eq!(count(&db, "state"), 0);
        let remaining: Vec<String> = db
            .conn()
            .prepare("SELECT device_id FROM device")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(remaining, vec!["dev2"]);
    }

    #[test]
    fn remove_without_scope_is_rejected() {
        let db = setup();
        assert!(remove_state(db.conn(), &RemoveStateOptions::default()).is_err());
    }
}
