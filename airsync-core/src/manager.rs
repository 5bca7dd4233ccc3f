//! The state-manager façade driven by protocol handlers.
//!
//! One `StateManager` is created per inbound request and owns the
//! request's store handle, the loaded snapshot, the pending-changes list
//! and the cached device record. It must never be shared across
//! concurrent requests; cross-request consistency rests entirely on the
//! store's transactional semantics plus sync-key uniqueness.

use crate::backend::ContentBackend;
use crate::cache::{self, CacheField, SyncCache};
use crate::database::models::StateRow;
use crate::database::{Database, StoreLocation};
use crate::device::{self, DeviceFilter, DeviceListEntry, DeviceRecord, RemoveStateOptions};
use crate::map::{self, MailMapMatch, MapContext};
use crate::models::{
    ChangeOrigin, ChangeType, CollectionContext, ContentClass, RemoteWipeStatus, RequestType,
    SyncChange,
};
use crate::snapshot::{self, CollectionSnapshot, FolderEntry, SyncData};
use crate::state;
use crate::synckey::{self, SyncKey};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Sentinel folder id under which hierarchy state is stored.
pub const HIERARCHY_FOLDER_ID: &str = "foldersync";

/// Minimum stamp gap before an idle collection gets a stamp-only refresh.
pub const STAMP_REFRESH_THRESHOLD: i64 = 30_000;

/// Per-request orchestrator over the sync store.
pub struct StateManager {
    db: Option<Database>,
    location: StoreLocation,
    device_id: String,
    user: String,
    device: Option<DeviceRecord>,
    policy_key: Option<i64>,
    sync_key: Option<SyncKey>,
    request_type: Option<RequestType>,
    folder_id: Option<String>,
    class: Option<ContentClass>,
    last_sync_stamp: i64,
    this_sync_stamp: i64,
    data: Option<SyncData>,
    pending: Vec<SyncChange>,
    changes_recorded: bool,
}

impl StateManager {
    /// Create a manager for one request of `(device, user)`.
    pub fn new(db: Database, device_id: &str, user: &str) -> Self {
        let location = db.location().clone();
        Self {
            db: Some(db),
            location,
            device_id: device_id.to_string(),
            user: user.to_string(),
            device: None,
            policy_key: None,
            sync_key: None,
            request_type: None,
            folder_id: None,
            class: None,
            last_sync_stamp: 0,
            this_sync_stamp: 0,
            data: None,
            pending: Vec::new(),
            changes_recorded: false,
        }
    }

    fn db(&self) -> Result<&Database> {
        self.db
            .as_ref()
            .ok_or_else(|| Error::InvariantViolation("store handle is disconnected".to_string()))
    }

    fn db_mut(&mut self) -> Result<&mut Database> {
        self.db
            .as_mut()
            .ok_or_else(|| Error::InvariantViolation("store handle is disconnected".to_string()))
    }

    fn loaded_folder(&self) -> Result<&str> {
        self.folder_id
            .as_deref()
            .ok_or_else(|| Error::InvariantViolation("no collection loaded".to_string()))
    }

    fn loaded_sync_key(&self) -> Result<&SyncKey> {
        self.sync_key
            .as_ref()
            .ok_or_else(|| Error::InvariantViolation("no sync key loaded".to_string()))
    }

    fn current_class(&self) -> Option<ContentClass> {
        self.class.or(match &self.data {
            Some(SyncData::Collection(snapshot)) => Some(snapshot.class()),
            _ => None,
        })
    }

    // ---- state ----

    /// Load the state tied to `sync_key`. Fails with [`Error::StateGone`]
    /// when no matching generation survives; the caller answers the
    /// client with a key-mismatch status.
    pub fn load_state(
        &mut self,
        sync_key: &SyncKey,
        request_type: RequestType,
        collection: Option<&CollectionContext>,
    ) -> Result<()> {
        let row = state::fetch_state(
            self.db()?.conn(),
            sync_key,
            collection.map(|c| c.id.as_str()),
        )?
        .ok_or(Error::StateGone)?;

        self.sync_key = Some(sync_key.clone());
        self.request_type = Some(request_type);
        self.folder_id = Some(row.folder_id.clone());
        self.class = collection.map(|c| c.class);
        self.last_sync_stamp = row.sync_mod;
        // Pre-set so a client-to-server-only cycle leaves the stamp as-is.
        self.this_sync_stamp = row.sync_mod;
        self.changes_recorded = false;

        self.data = Some(if row.sync_data.is_empty() {
            match (request_type, collection) {
                (RequestType::FolderSync, _) => SyncData::Folders(Vec::new()),
                (_, Some(ctx)) => {
                    SyncData::Collection(CollectionSnapshot::empty(ctx.class, &ctx.id))
                }
                (_, None) => {
                    return Err(Error::InvariantViolation(
                        "collection metadata required to synthesize empty state".to_string(),
                    ))
                }
            }
        } else {
            snapshot::decode_blob(&row.sync_data)?
        });
        self.pending = snapshot::decode_pending(&row.sync_pending)?;

        debug!(
            device = %self.device_id,
            user = %self.user,
            key = %sync_key,
            pending = self.pending.len(),
            "state loaded"
        );

        self.collect_garbage(&row.folder_id, sync_key)?;
        Ok(())
    }

    /// Persist the current state under the current sync key, with replace
    /// semantics. Generation 1 of a series always stores stamp 0 so the
    /// next cycle exposes the full backlog.
    pub fn save(&mut self) -> Result<()> {
        let sync_key = self.loaded_sync_key()?.clone();
        let folder_id = self
            .folder_id
            .clone()
            .unwrap_or_else(|| HIERARCHY_FOLDER_ID.to_string());

        let sync_mod = if sync_key.counter() == 1 {
            0
        } else {
            self.this_sync_stamp
        };
        let sync_data = match &self.data {
            Some(data) => snapshot::encode_blob(data)?,
            None => Vec::new(),
        };
        let sync_pending = if self.pending.is_empty() {
            Vec::new()
        } else {
            snapshot::encode_blob(&self.pending)?
        };

        let row = StateRow {
            sync_key: sync_key.to_string(),
            sync_data,
            device_id: self.device_id.clone(),
            folder_id: folder_id.clone(),
            user: self.user.clone(),
            sync_mod,
            sync_pending,
            sync_timestamp: Utc::now().timestamp(),
        };
        state::save_state(self.db_mut()?.conn_mut(), &row)?;
        self.last_sync_stamp = sync_mod;

        debug!(device = %self.device_id, user = %self.user, key = %sync_key, "state saved");

        self.collect_garbage(&folder_id, &sync_key)?;
        Ok(())
    }

    /// Stamp-only refresh of an idle collection: only when the stamp gap
    /// reached the threshold and no changes went through this cycle.
    /// Returns whether the row was actually refreshed; losing the
    /// optimistic guard to a concurrent request is not an error.
    pub fn update_sync_stamp(&mut self) -> Result<bool> {
        if self.changes_recorded
            || self.this_sync_stamp - self.last_sync_stamp < STAMP_REFRESH_THRESHOLD
        {
            return Ok(false);
        }
        let sync_key = self.loaded_sync_key()?.clone();
        let won = state::update_sync_stamp(
            self.db()?.conn(),
            &sync_key,
            self.last_sync_stamp,
            self.this_sync_stamp,
            Utc::now().timestamp(),
        )?;
        if won {
            self.last_sync_stamp = self.this_sync_stamp;
        }
        Ok(won)
    }

    /// Rewrite the backend server id embedded in every state row of
    /// `folder_uid`, as happens when a folder is renamed but keeps its
    /// client-facing uid.
    pub fn update_server_id_in_state(
        &mut self,
        folder_uid: &str,
        new_server_id: &str,
    ) -> Result<u32> {
        let rewritten = state::update_server_id(
            self.db()?.conn(),
            &self.device_id,
            &self.user,
            folder_uid,
            new_server_id,
        )?;
        if self.folder_id.as_deref() == Some(folder_uid) {
            if let Some(data) = &mut self.data {
                data.update_server_id(folder_uid, new_server_id);
            }
        }
        Ok(rewritten)
    }

    /// Apply one change to the managed state.
    ///
    /// Client-originated changes mutate the in-memory folder list (on a
    /// hierarchy sync) or land in the change log (on a collection sync)
    /// so they are not echoed back later. Server-originated changes are
    /// struck from the pending list and, on a hierarchy sync, refresh the
    /// folder snapshot from the content driver.
    pub fn update_state(
        &mut self,
        change_type: ChangeType,
        change: &SyncChange,
        origin: ChangeOrigin,
        backend: Option<&dyn ContentBackend>,
    ) -> Result<()> {
        match origin {
            ChangeOrigin::Client => self.apply_client_change(change_type, change),
            ChangeOrigin::Server => self.apply_server_change(change_type, change, backend),
        }
    }

    fn apply_client_change(&mut self, change_type: ChangeType, change: &SyncChange) -> Result<()> {
        if self.request_type == Some(RequestType::FolderSync) {
            let folders = match &mut self.data {
                Some(SyncData::Folders(folders)) => folders,
                _ => {
                    return Err(Error::InvariantViolation(
                        "hierarchy change without a folder snapshot".to_string(),
                    ))
                }
            };
            folders.retain(|entry| entry.id != change.server_id);
            if change_type != ChangeType::Delete {
                let entry = change.folder.clone().ok_or_else(|| {
                    Error::InvariantViolation("folder change without folder entry".to_string())
                })?;
                folders.push(entry);
            }
            // No store write here; the new list rides the next save.
            self.changes_recorded = true;
            return Ok(());
        }

        let folder = self.loaded_folder()?.to_string();
        let sync_key = match &self.sync_key {
            Some(key) => key.clone(),
            // A MOVEITEMS does not carry a key; fall back to the latest
            // one known for the target collection.
            None => state::latest_sync_key_for_collection(
                self.db()?.conn(),
                &self.device_id,
                &self.user,
                &folder,
            )?
            .ok_or_else(|| {
                Error::InvariantViolation("no sync key known for collection".to_string())
            })?,
        };
        let ctx = MapContext {
            device: &self.device_id,
            user: &self.user,
            folder: &folder,
        };

        let mut recorded = change.clone();
        recorded.change_type = change_type;

        if self.current_class() == Some(ContentClass::Email) {
            let has_flags = recorded
                .flags
                .as_ref()
                .map(|f| !f.is_empty())
                .unwrap_or(false);
            if recorded.change_type == ChangeType::Change && has_flags {
                recorded.change_type = ChangeType::Flags;
            }
            map::record_mail_change(self.db()?.conn(), ctx, &sync_key, &recorded)?;
            // Adds also hit the generic map so a retried Add dedupes by
            // its client id.
            if recorded.change_type == ChangeType::Add {
                map::record_change(self.db()?.conn(), ctx, &sync_key, &recorded)?;
            }
        } else {
            map::record_change(self.db()?.conn(), ctx, &sync_key, &recorded)?;
        }

        self.changes_recorded = true;
        Ok(())
    }

    fn apply_server_change(
        &mut self,
        change_type: ChangeType,
        change: &SyncChange,
        backend: Option<&dyn ContentBackend>,
    ) -> Result<()> {
        // Strike the dispatched change off the pending list so it is not
        // redelivered on the next cycle.
        let position = self
            .pending
            .iter()
            .position(|p| p.server_id == change.server_id && p.change_type == change_type)
            .or_else(|| {
                self.pending
                    .iter()
                    .position(|p| p.server_id == change.server_id)
            });
        if let Some(position) = position {
            self.pending.remove(position);
        }

        if self.request_type != Some(RequestType::FolderSync) {
            return Ok(());
        }

        let folder_uid = change
            .folder
            .as_ref()
            .map(|f| f.id.as_str())
            .unwrap_or(change.server_id.as_str())
            .to_string();
        let fresh = if change_type == ChangeType::Delete {
            None
        } else {
            let given = change.folder.clone().ok_or_else(|| {
                Error::InvariantViolation("folder change without folder entry".to_string())
            })?;
            let backend = backend.ok_or_else(|| {
                Error::InvariantViolation("content backend required for folder refresh".to_string())
            })?;
            Some(match backend.get_folder(&given.server_id) {
                Some(stat) => backend.stat_folder(&given.id, &stat),
                None => given,
            })
        };

        let folders = match &mut self.data {
            Some(SyncData::Folders(folders)) => folders,
            _ => {
                return Err(Error::InvariantViolation(
                    "hierarchy change without a folder snapshot".to_string(),
                ))
            }
        };
        folders.retain(|entry| entry.id != folder_uid);
        if let Some(entry) = fresh {
            folders.push(entry);
        }
        Ok(())
    }

    /// Drop every trace of `collection_id` for this (device, user): state
    /// rows, change log, and its cache slice. The hierarchy sentinel
    /// clears the whole folder cache instead.
    pub fn reset_device_state(&mut self, collection_id: &str) -> Result<()> {
        let conn = self.db()?.conn();
        state::delete_states_for_collection(conn, &self.device_id, &self.user, collection_id)?;
        map::delete_maps_for_collection(
            conn,
            MapContext {
                device: &self.device_id,
                user: &self.user,
                folder: collection_id,
            },
        )?;

        let mut cached = cache::get(conn, &self.device_id, &self.user)?;
        if collection_id == HIERARCHY_FOLDER_ID {
            cached.clear_hierarchy();
        } else {
            cached.remove_collection(collection_id);
        }
        cache::save(conn, &mut cached, &self.device_id, &self.user)?;

        info!(device = %self.device_id, user = %self.user, collection = collection_id, "state reset");
        Ok(())
    }

    // ---- sync keys ----

    /// Issue the sync key for the next response: the next generation of
    /// the presented key, or a fresh series when none was presented. The
    /// first generation of a series is re-minted until it does not
    /// collide with another series of this device.
    pub fn get_new_sync_key(&mut self, current: Option<&SyncKey>) -> Result<SyncKey> {
        let folder = self
            .folder_id
            .clone()
            .unwrap_or_else(|| HIERARCHY_FOLDER_ID.to_string());
        let mut candidate = match current {
            Some(key) => key.next(),
            None => SyncKey::new(),
        };
        if candidate.counter() == 1 {
            while synckey::check_collision(
                self.db()?.conn(),
                candidate.series(),
                &self.device_id,
                &folder,
            )? {
                candidate = SyncKey::new();
            }
        }
        self.sync_key = Some(candidate.clone());
        Ok(candidate)
    }

    /// Adopt an externally chosen sync key for the next save.
    pub fn set_new_sync_key(&mut self, key: SyncKey) {
        self.sync_key = Some(key);
    }

    /// The currently loaded sync key, if any.
    pub fn sync_key(&self) -> Option<&SyncKey> {
        self.sync_key.as_ref()
    }

    /// The most recently saved sync key of a collection.
    pub fn get_latest_sync_key_for_collection(&self, folder: &str) -> Result<Option<SyncKey>> {
        state::latest_sync_key_for_collection(self.db()?.conn(), &self.device_id, &self.user, folder)
    }

    // ---- snapshot access ----

    /// Scope the manager to a collection without loading state, as a
    /// key-less request (MOVEITEMS) needs before `update_state`.
    pub fn set_collection(&mut self, collection: &CollectionContext) {
        self.folder_id = Some(collection.id.clone());
        self.class = Some(collection.class);
    }

    /// The in-memory folder list of a hierarchy sync.
    pub fn folders(&self) -> Option<&[FolderEntry]> {
        match &self.data {
            Some(SyncData::Folders(folders)) => Some(folders),
            _ => None,
        }
    }

    /// Replace the folder list, as the initial hierarchy sync does after
    /// enumerating the backend.
    pub fn set_folders(&mut self, folders: Vec<FolderEntry>) {
        self.data = Some(SyncData::Folders(folders));
    }

    /// The in-memory collection snapshot of a content sync.
    pub fn collection(&self) -> Option<&CollectionSnapshot> {
        match &self.data {
            Some(SyncData::Collection(snapshot)) => Some(snapshot),
            _ => None,
        }
    }

    /// Mutable access to the collection snapshot.
    pub fn collection_mut(&mut self) -> Option<&mut CollectionSnapshot> {
        match &mut self.data {
            Some(SyncData::Collection(snapshot)) => Some(snapshot),
            _ => None,
        }
    }

    /// Server-to-client changes deferred by window-size truncation.
    pub fn pending(&self) -> &[SyncChange] {
        &self.pending
    }

    /// Replace the pending list, typically with the untransmitted tail of
    /// an export run.
    pub fn set_pending(&mut self, pending: Vec<SyncChange>) {
        self.pending = pending;
    }

    /// Stamp published by the content driver for this cycle.
    pub fn set_sync_stamp(&mut self, stamp: i64) {
        self.this_sync_stamp = stamp;
    }

    /// Current cycle's stamp.
    pub fn sync_stamp(&self) -> i64 {
        self.this_sync_stamp
    }

    /// Stamp the previous cycle was snapshotted at.
    pub fn last_sync_stamp(&self) -> i64 {
        self.last_sync_stamp
    }

    /// Whether this cycle recorded client-originated changes. Hierarchy
    /// handlers push a response when the exporter produced output or this
    /// is true.
    pub fn had_inbound_changes(&self) -> bool {
        self.changes_recorded
    }

    // ---- loop suppression ----

    /// Server uid previously assigned to an Add carrying `client_id`, if
    /// that Add already went through. The retried Add is answered
    /// idempotently.
    pub fn is_duplicate_pim_addition(&self, client_id: &str) -> Result<Option<String>> {
        let folder = self.loaded_folder()?;
        map::is_duplicate_addition(
            self.db()?.conn(),
            MapContext {
                device: &self.device_id,
                user: &self.user,
                folder,
            },
            client_id,
        )
    }

    /// Whether `uid` already has a change recorded under `sync_key`.
    pub fn is_duplicate_pim_change(&self, uid: &str, sync_key: &SyncKey) -> Result<bool> {
        let folder = self.loaded_folder()?;
        map::is_duplicate_change(
            self.db()?.conn(),
            MapContext {
                device: &self.device_id,
                user: &self.user,
                folder,
            },
            uid,
            sync_key,
        )
    }

    /// Per-uid newest recorded client modtime for the candidate export
    /// list; candidates at or below their entry are already on the client.
    pub fn pim_change_timestamps(&self, changes: &[SyncChange]) -> Result<BTreeMap<String, i64>> {
        let folder = self.loaded_folder()?;
        map::pim_change_timestamps(
            self.db()?.conn(),
            MapContext {
                device: &self.device_id,
                user: &self.user,
                folder,
            },
            self.loaded_sync_key()?,
            changes,
        )
    }

    /// Per-uid agreement between recorded mail changes and the candidate
    /// export list; agreeing candidates are dropped.
    pub fn mailmap_changes(
        &self,
        changes: &[SyncChange],
    ) -> Result<BTreeMap<String, MailMapMatch>> {
        let folder = self.loaded_folder()?;
        map::mailmap_changes(
            self.db()?.conn(),
            MapContext {
                device: &self.device_id,
                user: &self.user,
                folder,
            },
            self.loaded_sync_key()?,
            changes,
        )
    }

    /// Whether loop suppression needs to run at all for this scope.
    pub fn has_pim_changes(&self) -> Result<bool> {
        let folder = self.loaded_folder()?;
        map::has_pim_changes(
            self.db()?.conn(),
            MapContext {
                device: &self.device_id,
                user: &self.user,
                folder,
            },
            self.current_class() == Some(ContentClass::Email),
        )
    }

    // ---- device registry ----

    /// Load a device, short-circuiting to the copy cached on this
    /// manager. `force` bypasses the cache; needed because a long-running
    /// request can have the wipe status flipped under it.
    pub fn load_device_info(
        &mut self,
        id: &str,
        user: Option<&str>,
        force: bool,
    ) -> Result<&DeviceRecord> {
        let cached = !force
            && self
                .device
                .as_ref()
                .map(|d| d.device_id == id)
                .unwrap_or(false);
        if !cached {
            let (record, policy_key) = device::load_device(self.db()?.conn(), id, user)?;
            self.device = Some(record);
            self.policy_key = policy_key;
        } else if let Some(user) = user {
            self.policy_key = device::get_policy_key(self.db()?.conn(), id, user)?;
        }
        self.device
            .as_ref()
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))
    }

    /// Policy key loaded with the device; 0 means "not provisioned".
    pub fn policy_key(&self) -> i64 {
        self.policy_key.unwrap_or(0)
    }

    /// Insert or update the device row and keep the manager's cached copy
    /// in step. A record identical to the cached one is not rewritten.
    pub fn set_device_info(&mut self, record: &DeviceRecord) -> Result<()> {
        if self.device.as_ref() == Some(record) {
            return Ok(());
        }
        device::set_device(self.db()?.conn(), record, Some(&self.user))?;
        self.device = Some(record.clone());
        Ok(())
    }

    /// Update only the mutable properties blob.
    pub fn set_device_properties(
        &mut self,
        properties: &BTreeMap<String, String>,
    ) -> Result<()> {
        device::set_device_properties(self.db()?.conn(), &self.device_id, properties)?;
        if let Some(device) = &mut self.device {
            device.properties = properties.clone();
        }
        Ok(())
    }

    /// How many registry rows match; 0 means "unknown device".
    pub fn device_exists(&self, id: &str, user: Option<&str>) -> Result<u32> {
        device::device_exists(self.db()?.conn(), id, user)
    }

    /// All (device, user) pairings matching the filters.
    pub fn list_devices(
        &self,
        user: Option<&str>,
        filter: &DeviceFilter,
    ) -> Result<Vec<DeviceListEntry>> {
        device::list_devices(self.db()?.conn(), user, filter)
    }

    /// Wallclock of the newest saved state of this (device, user).
    pub fn get_last_sync_timestamp(&self) -> Result<Option<i64>> {
        state::last_sync_timestamp(self.db()?.conn(), &self.device_id, &self.user)
    }

    /// Store the policy key for the currently loaded device. Calling this
    /// for any other device is a programming error.
    pub fn set_policy_key(&mut self, device: &str, key: i64) -> Result<()> {
        let loaded = self
            .device
            .as_ref()
            .map(|d| d.device_id == device)
            .unwrap_or(false);
        if !loaded {
            return Err(Error::InvariantViolation(
                "policy key update for a device that is not loaded".to_string(),
            ));
        }
        device::set_policy_key(self.db()?.conn(), device, &self.user, key)?;
        self.policy_key = Some(key);
        Ok(())
    }

    /// Zero every policy key, forcing a global reprovision.
    pub fn reset_all_policy_keys(&self) -> Result<u32> {
        device::reset_all_policy_keys(self.db()?.conn())
    }

    /// Update a device's remote-wipe status; arming a wipe also zeroes
    /// its policy keys.
    pub fn set_device_rw_status(&mut self, device: &str, status: RemoteWipeStatus) -> Result<()> {
        device::set_device_rw_status(self.db()?.conn(), device, status)?;
        if let Some(cached) = &mut self.device {
            if cached.device_id == device {
                cached.rw_status = status;
            }
        }
        Ok(())
    }

    /// Multi-mode removal of state and registry rows.
    pub fn remove_state(&mut self, opts: &RemoveStateOptions) -> Result<()> {
        device::remove_state(self.db()?.conn(), opts)?;
        // The cached device may describe a row that just went away.
        self.device = None;
        self.policy_key = None;
        Ok(())
    }

    // ---- sync cache ----

    /// The cache of this (device, user); zero-value when absent.
    pub fn get_sync_cache(&self) -> Result<SyncCache> {
        cache::get(self.db()?.conn(), &self.device_id, &self.user)
    }

    /// The cache restricted to the requested fields.
    pub fn get_sync_cache_fields(&self, fields: &[CacheField]) -> Result<SyncCache> {
        cache::get_fields(self.db()?.conn(), &self.device_id, &self.user, fields)
    }

    /// Upsert the cache of this (device, user).
    pub fn save_sync_cache(&self, cache: &mut SyncCache) -> Result<()> {
        cache::save(self.db()?.conn(), cache, &self.device_id, &self.user)
    }

    /// Delete the cache of this (device, user).
    pub fn delete_sync_cache(&self) -> Result<()> {
        cache::delete(self.db()?.conn(), Some(&self.device_id), Some(&self.user))?;
        Ok(())
    }

    // ---- lifecycle ----

    /// Release the store handle around a long-poll sleep.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.location == StoreLocation::Memory {
            return Err(Error::InvariantViolation(
                "cannot disconnect an in-memory store".to_string(),
            ));
        }
        self.db = None;
        Ok(())
    }

    /// Reacquire the store handle after a long-poll sleep.
    pub fn connect(&mut self) -> Result<()> {
        if self.db.is_none() {
            self.db = Some(Database::reopen(&self.location)?);
        }
        Ok(())
    }

    fn collect_garbage(&self, folder: &str, sync_key: &SyncKey) -> Result<()> {
        let conn = self.db()?.conn();
        state::gc_states(conn, &self.device_id, &self.user, folder, sync_key)?;
        map::gc_maps(conn, &self.device_id, &self.user, sync_key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FixtureBackend;
    use crate::backend::FolderStat;
    use crate::models::MessageFlags;

    fn manager() -> StateManager {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        StateManager::new(db, "dev1", "alice")
    }

    fn email_ctx() -> CollectionContext {
        CollectionContext {
            id: "inbox".to_string(),
            class: ContentClass::Email,
        }
    }

    fn contacts_ctx() -> CollectionContext {
        CollectionContext {
            id: "contacts".to_string(),
            class: ContentClass::Contacts,
        }
    }

    fn item_change(uid: &str, change_type: ChangeType, modtime: i64) -> SyncChange {
        SyncChange {
            server_id: uid.to_string(),
            change_type,
            modtime,
            flags: None,
            client_id: None,
            folder: None,
        }
    }

    fn folder_change(id: &str, server_id: &str, change_type: ChangeType) -> SyncChange {
        SyncChange {
            server_id: id.to_string(),
            change_type,
            modtime: 0,
            flags: None,
            client_id: None,
            folder: Some(FolderEntry {
                id: id.to_string(),
                server_id: server_id.to_string(),
                parent: "0".to_string(),
                display_name: id.to_string(),
                folder_type: 12,
            }),
        }
    }

    /// Run one full sync cycle so a state row exists: mint the first key
    /// of a fresh series and save an empty snapshot.
    fn first_sync(mgr: &mut StateManager, ctx: &CollectionContext) -> SyncKey {
        mgr.set_collection(ctx);
        let key = mgr.get_new_sync_key(None).unwrap();
        mgr.data = Some(SyncData::Collection(CollectionSnapshot::empty(
            ctx.class, &ctx.id,
        )));
        mgr.save().unwrap();
        key
    }

    /// Hand the store handle over to a fresh manager, as the next request
    /// would get.
    fn next_request(mgr: &mut StateManager) -> StateManager {
        let db = mgr.db.take().unwrap();
        StateManager::new(db, "dev1", "alice")
    }

    #[test]
    fn first_sync_stores_generation_one_with_zero_stamp() {
        let mut mgr = manager();
        let ctx = email_ctx();

        // Client opened the series with {G}0.
        let presented = SyncKey::parse("{11111111-2222-3333-4444-555555555555}0").unwrap();
        mgr.set_collection(&ctx);
        let issued = mgr.get_new_sync_key(Some(&presented)).unwrap();
        assert_eq!(issued.counter(), 1);
        assert!(issued.same_series(&presented));

        mgr.data = Some(SyncData::Collection(CollectionSnapshot::empty(
            ctx.class, &ctx.id,
        )));
        mgr.set_sync_stamp(98765);
        mgr.save().unwrap();

        let row = state::fetch_state(mgr.db().unwrap().conn(), &issued, Some("inbox"))
            .unwrap()
            .unwrap();
        // Generation 1 persists stamp 0 regardless of the cycle's stamp.
        assert_eq!(row.sync_mod, 0);
        assert!(!row.sync_data.is_empty());
    }

    #[test]
    fn colliding_first_generation_is_reminted() {
        let mut mgr = manager();
        // Seed a state row using series "abc" on another folder.
        mgr.db()
            .unwrap()
            .conn()
            .execute(
                "INSERT INTO state (sync_key, sync_devid, sync_folderid, sync_user)
                 VALUES ('{abc}1', 'dev1', 'contacts', 'alice')",
                [],
            )
            .unwrap();

        mgr.set_collection(&email_ctx());
        let presented = SyncKey::parse("{abc}0").unwrap();
        let issued = mgr.get_new_sync_key(Some(&presented)).unwrap();
        // The colliding series was abandoned for a fresh one.
        assert!(!issued.same_series(&presented));
        assert_eq!(issued.counter(), 1);
    }

    #[test]
    fn load_roundtrips_saved_state() {
        let mut mgr = manager();
        let ctx = contacts_ctx();
        let key = first_sync(&mut mgr, &ctx);

        let next = mgr.get_new_sync_key(Some(&key)).unwrap();
        mgr.set_sync_stamp(500);
        mgr.set_pending(vec![item_change("c1", ChangeType::Change, 400)]);
        mgr.save().unwrap();

        let mut fresh = next_request(&mut mgr);
        fresh
            .load_state(&next, RequestType::Sync, Some(&ctx))
            .unwrap();
        assert_eq!(fresh.last_sync_stamp(), 500);
        assert_eq!(fresh.sync_stamp(), 500);
        assert_eq!(fresh.pending().len(), 1);
        assert_eq!(fresh.collection().unwrap().class(), ContentClass::Contacts);
    }

    #[test]
    fn load_of_collected_key_fails_state_gone() {
        let mut mgr = manager();
        let ctx = email_ctx();
        let mut key = first_sync(&mut mgr, &ctx);
        // Advance far enough that generation 1 is collected.
        for _ in 0..3 {
            key = mgr.get_new_sync_key(Some(&key)).unwrap();
            mgr.save().unwrap();
        }

        let gone = SyncKey::parse(&format!("{{{}}}1", key.series())).unwrap();
        let err = mgr
            .load_state(&gone, RequestType::Sync, Some(&ctx))
            .unwrap_err();
        assert!(matches!(err, Error::StateGone));

        // The retained previous generation still loads.
        let previous = key.previous().unwrap();
        mgr.load_state(&previous, RequestType::Sync, Some(&ctx))
            .unwrap();
    }

    #[test]
    fn email_flag_change_feeds_loop_suppression() {
        let mut mgr = manager();
        let ctx = email_ctx();
        let key = first_sync(&mut mgr, &ctx);
        let key = mgr.get_new_sync_key(Some(&key)).unwrap();
        mgr.save().unwrap();
        mgr.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();

        // Client sets the read flag on uid 77; a Change with flags is
        // promoted to a Flags row.
        let mut change = item_change("77", ChangeType::Change, 100);
        change.flags = Some(MessageFlags {
            read: Some(true),
            ..Default::default()
        });
        mgr.update_state(ChangeType::Change, &change, ChangeOrigin::Client, None)
            .unwrap();

        // The next export cycle sees the same state coming back and drops it.
        let candidate = SyncChange {
            server_id: "77".to_string(),
            change_type: ChangeType::Flags,
            modtime: 100,
            flags: Some(MessageFlags {
                read: Some(true),
                ..Default::default()
            }),
            client_id: None,
            folder: None,
        };
        let matches = mgr.mailmap_changes(std::slice::from_ref(&candidate)).unwrap();
        assert!(matches.get("77").unwrap().flags);
        assert!(mgr.has_pim_changes().unwrap());
    }

    #[test]
    fn retried_add_is_answered_idempotently() {
        let mut mgr = manager();
        let ctx = contacts_ctx();
        let key = first_sync(&mut mgr, &ctx);
        let key = mgr.get_new_sync_key(Some(&key)).unwrap();
        mgr.save().unwrap();
        mgr.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();

        let mut added = item_change("uid-42", ChangeType::Add, 100);
        added.client_id = Some("client-7".to_string());
        mgr.update_state(ChangeType::Add, &added, ChangeOrigin::Client, None)
            .unwrap();

        // The response was lost; the client retries with the same tag.
        assert_eq!(
            mgr.is_duplicate_pim_addition("client-7").unwrap(),
            Some("uid-42".to_string())
        );
        assert!(mgr.is_duplicate_pim_addition("client-8").unwrap().is_none());
        assert!(mgr.is_duplicate_pim_change("uid-42", &key).unwrap());
    }

    #[test]
    fn moveitems_without_key_uses_latest_for_collection() {
        let mut mgr = manager();
        let ctx = contacts_ctx();
        let key = first_sync(&mut mgr, &ctx);

        // A fresh manager without loaded state, as MOVEITEMS arrives.
        let mut mover = next_request(&mut mgr);
        mover.set_collection(&ctx);
        let moved = item_change("c9", ChangeType::Delete, 50);
        mover
            .update_state(ChangeType::Delete, &moved, ChangeOrigin::Client, None)
            .unwrap();

        let recorded: (String, bool) = mover
            .db()
            .unwrap()
            .conn()
            .query_row(
                "SELECT sync_key, sync_deleted FROM map WHERE message_uid = 'c9'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(recorded.0, key.to_string());
        assert!(recorded.1);
    }

    #[test]
    fn hierarchy_client_change_mutates_folder_list_only() {
        let mut mgr = manager();
        mgr.set_new_sync_key(SyncKey::new());
        mgr.folder_id = Some(HIERARCHY_FOLDER_ID.to_string());
        mgr.request_type = Some(RequestType::FolderSync);
        mgr.set_folders(vec![
            folder_change("f1", "s1", ChangeType::Add).folder.unwrap(),
            folder_change("f2", "s2", ChangeType::Add).folder.unwrap(),
        ]);

        let renamed = folder_change("f1", "s1-renamed", ChangeType::Change);
        mgr.update_state(ChangeType::Change, &renamed, ChangeOrigin::Client, None)
            .unwrap();
        let removed = folder_change("f2", "s2", ChangeType::Delete);
        mgr.update_state(ChangeType::Delete, &removed, ChangeOrigin::Client, None)
            .unwrap();

        let folders = mgr.folders().unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].id, "f1");
        assert_eq!(folders[0].server_id, "s1-renamed");

        // Nothing was written to the store; the next save persists it.
        let count: i64 = mgr
            .db()
            .unwrap()
            .conn()
            .query_row("SELECT COUNT(*) FROM map", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn hierarchy_server_change_refreshes_from_backend() {
        let mut mgr = manager();
        mgr.set_new_sync_key(SyncKey::new());
        mgr.folder_id = Some(HIERARCHY_FOLDER_ID.to_string());
        mgr.request_type = Some(RequestType::FolderSync);
        mgr.set_folders(vec![folder_change("f1", "s1", ChangeType::Add)
            .folder
            .unwrap()]);
        mgr.set_pending(vec![folder_change("f1", "s1", ChangeType::Change)]);

        let backend = FixtureBackend::default().with_folder(FolderStat {
            server_id: "s1".to_string(),
            parent: "0".to_string(),
            display_name: "Renamed".to_string(),
            folder_type: 12,
        });

        let change = folder_change("f1", "s1", ChangeType::Change);
        mgr.update_state(
            ChangeType::Change,
            &change,
            ChangeOrigin::Server,
            Some(&backend),
        )
        .unwrap();

        // Dispatched change left the pending list and the snapshot holds
        // the driver's fresh stat.
        assert!(mgr.pending().is_empty());
        assert_eq!(mgr.folders().unwrap()[0].display_name, "Renamed");
    }

    #[test]
    fn stamp_refresh_needs_gap_and_quiet_cycle() {
        let mut mgr = manager();
        let ctx = contacts_ctx();
        let key = first_sync(&mut mgr, &ctx);
        let key = mgr.get_new_sync_key(Some(&key)).unwrap();
        mgr.set_sync_stamp(100);
        mgr.save().unwrap();

        mgr.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();
        // Below the threshold: no refresh.
        mgr.set_sync_stamp(100 + STAMP_REFRESH_THRESHOLD - 1);
        assert!(!mgr.update_sync_stamp().unwrap());

        mgr.set_sync_stamp(100 + STAMP_REFRESH_THRESHOLD);
        assert!(mgr.update_sync_stamp().unwrap());

        // With inbound changes this cycle, never.
        mgr.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();
        mgr.update_state(
            ChangeType::Change,
            &item_change("c1", ChangeType::Change, 1),
            ChangeOrigin::Client,
            None,
        )
        .unwrap();
        mgr.set_sync_stamp(1_000_000);
        assert!(!mgr.update_sync_stamp().unwrap());
    }

    #[test]
    fn concurrent_stamp_refresh_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.sqlite");
        let db = Database::open(&path).unwrap();
        db.initialize_schema().unwrap();

        let ctx = contacts_ctx();
        let mut first = StateManager::new(db, "dev1", "alice");
        let key = first_sync(&mut first, &ctx);
        let key = first.get_new_sync_key(Some(&key)).unwrap();
        first.set_sync_stamp(100);
        first.save().unwrap();

        let mut second = StateManager::new(Database::open(&path).unwrap(), "dev1", "alice");
        first.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();
        second.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();

        first.set_sync_stamp(100 + STAMP_REFRESH_THRESHOLD);
        second.set_sync_stamp(100 + STAMP_REFRESH_THRESHOLD + 5);

        let first_won = first.update_sync_stamp().unwrap();
        let second_won = second.update_sync_stamp().unwrap();
        assert!(first_won);
        assert!(!second_won, "optimistic guard admitted both writers");
    }

    #[test]
    fn wipe_pending_forces_reprovision() {
        let mut mgr = manager();
        let record = DeviceRecord {
            device_id: "dev1".to_string(),
            device_type: "phone".to_string(),
            user_agent: "Client/1.0".to_string(),
            ..Default::default()
        };
        mgr.set_device_info(&record).unwrap();
        mgr.set_policy_key("dev1", 4242).unwrap();
        assert_eq!(mgr.policy_key(), 4242);

        mgr.set_device_rw_status("dev1", RemoteWipeStatus::Pending)
            .unwrap();

        // The next request reloads and sees an unprovisioned pair.
        mgr.load_device_info("dev1", Some("alice"), true).unwrap();
        assert_eq!(mgr.policy_key(), 0);
        assert_eq!(
            mgr.device.as_ref().unwrap().rw_status,
            RemoteWipeStatus::Pending
        );
    }

    #[test]
    fn policy_key_requires_loaded_device() {
        let mut mgr = manager();
        let err = mgr.set_policy_key("phantom", 1).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn device_cache_short_circuits_and_force_reloads() {
        let mut mgr = manager();
        let record = DeviceRecord {
            device_id: "dev1".to_string(),
            user_agent: "Client/1.0".to_string(),
            ..Default::default()
        };
        mgr.set_device_info(&record).unwrap();

        // Mutate the row behind the manager's back.
        mgr.db()
            .unwrap()
            .conn()
            .execute(
                "UPDATE device SET device_rwstatus = 'pending' WHERE device_id = 'dev1'",
                [],
            )
            .unwrap();

        let cached = mgr.load_device_info("dev1", None, false).unwrap();
        assert_eq!(cached.rw_status, RemoteWipeStatus::NotApplicable);

        let forced = mgr.load_device_info("dev1", None, true).unwrap();
        assert_eq!(forced.rw_status, RemoteWipeStatus::Pending);
    }

    #[test]
    fn hierarchy_reset_clears_state_and_cache() {
        let mut mgr = manager();
        // Hierarchy state under the sentinel id.
        mgr.folder_id = Some(HIERARCHY_FOLDER_ID.to_string());
        mgr.request_type = Some(RequestType::FolderSync);
        let key = mgr.get_new_sync_key(None).unwrap();
        mgr.set_folders(vec![folder_change("f1", "s1", ChangeType::Add)
            .folder
            .unwrap()]);
        mgr.save().unwrap();

        let mut cached = mgr.get_sync_cache().unwrap();
        cached.hierarchy = key.to_string();
        cached
            .collections
            .insert("inbox".to_string(), Default::default());
        mgr.save_sync_cache(&mut cached).unwrap();

        mgr.reset_device_state(HIERARCHY_FOLDER_ID).unwrap();

        let err = mgr
            .load_state(&key, RequestType::FolderSync, None)
            .unwrap_err();
        assert!(matches!(err, Error::StateGone));

        let cached = mgr.get_sync_cache().unwrap();
        assert_eq!(cached.hierarchy, "0");
        assert!(cached.folders.is_empty());
        assert!(cached.collections.is_empty());
    }

    #[test]
    fn collection_reset_is_scoped() {
        let mut mgr = manager();
        let inbox = email_ctx();
        let contacts = contacts_ctx();
        let inbox_key = first_sync(&mut mgr, &inbox);
        let contacts_key = first_sync(&mut mgr, &contacts);

        mgr.reset_device_state("inbox").unwrap();

        assert!(matches!(
            mgr.load_state(&inbox_key, RequestType::Sync, Some(&inbox)),
            Err(Error::StateGone)
        ));
        mgr.load_state(&contacts_key, RequestType::Sync, Some(&contacts))
            .unwrap();
    }

    #[test]
    fn disconnect_and_reconnect_around_long_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.sqlite");
        let db = Database::open(&path).unwrap();
        db.initialize_schema().unwrap();

        let ctx = email_ctx();
        let mut mgr = StateManager::new(db, "dev1", "alice");
        let key = first_sync(&mut mgr, &ctx);

        mgr.disconnect().unwrap();
        assert!(matches!(
            mgr.get_sync_cache(),
            Err(Error::InvariantViolation(_))
        ));

        mgr.connect().unwrap();
        mgr.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();
    }

    #[test]
    fn in_memory_store_refuses_disconnect() {
        let mut mgr = manager();
        assert!(mgr.disconnect().is_err());
    }

    #[test]
    fn server_id_rename_updates_store_and_memory() {
        let mut mgr = manager();
        let ctx = contacts_ctx();
        let key = first_sync(&mut mgr, &ctx);
        mgr.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();

        let rewritten = mgr
            .update_server_id_in_state("contacts", "contacts-v2")
            .unwrap();
        assert_eq!(rewritten, 1);
        assert_eq!(mgr.collection().unwrap().server_id, "contacts-v2");

        // A reload sees the rewritten snapshot too.
        mgr.load_state(&key, RequestType::Sync, Some(&ctx)).unwrap();
        assert_eq!(mgr.collection().unwrap().server_id, "contacts-v2");
    }
}
