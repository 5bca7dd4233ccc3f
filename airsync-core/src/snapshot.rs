//! Snapshot blobs and their codec.
//!
//! The store treats `sync_data`, `sync_pending`, `device_supported`,
//! `device_properties` and `cache_data` as opaque blobs. They are all
//! encoded here through one versioned envelope so a future format change
//! never has to reinterpret old bytes: every blob starts with a format
//! version byte, followed by the bincode body.

use crate::models::{ContentClass, SyncChange};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version byte prefixed to every persisted blob.
pub const BLOB_FORMAT_VERSION: u8 = 1;

/// One folder in a hierarchy snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    /// Client-facing folder uid, stable across renames.
    pub id: String,
    /// Backend server id, rewritten on rename.
    pub server_id: String,
    pub parent: String,
    pub display_name: String,
    pub folder_type: u32,
}

/// Last-known flag state of one mail UID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    pub read: bool,
    pub flagged: bool,
    pub draft: bool,
}

/// Last-known stat of one non-mail item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    pub modtime: i64,
    pub flags: u32,
}

/// Per-collection snapshot: what the client is known to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    /// Backend server id of the collection.
    pub server_id: String,
    pub body: CollectionBody,
}

/// Class-specific snapshot body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionBody {
    /// IMAP-flavoured: UIDs the client holds, with their flags.
    Email { uids: BTreeMap<u32, MessageState> },
    /// Stat tuples keyed by item id.
    Generic {
        class: ContentClass,
        items: BTreeMap<String, ItemState>,
    },
}

impl CollectionSnapshot {
    /// An empty snapshot of the right shape for `class`.
    pub fn empty(class: ContentClass, server_id: &str) -> Self {
        let body = match class {
            ContentClass::Email => CollectionBody::Email {
                uids: BTreeMap::new(),
            },
            other => CollectionBody::Generic {
                class: other,
                items: BTreeMap::new(),
            },
        };
        Self {
            server_id: server_id.to_string(),
            body,
        }
    }

    /// Content class of this snapshot.
    pub fn class(&self) -> ContentClass {
        match &self.body {
            CollectionBody::Email { .. } => ContentClass::Email,
            CollectionBody::Generic { class, .. } => *class,
        }
    }
}

/// What a `sync_data` blob decodes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncData {
    /// Folder-hierarchy snapshot.
    Folders(Vec<FolderEntry>),
    /// Per-collection snapshot.
    Collection(CollectionSnapshot),
}

impl SyncData {
    /// Rewrite the embedded backend server id while keeping the
    /// client-facing uid, as happens when a folder is renamed.
    pub fn update_server_id(&mut self, folder_uid: &str, new_server_id: &str) {
        match self {
            SyncData::Collection(snapshot) => {
                snapshot.server_id = new_server_id.to_string();
            }
            SyncData::Folders(entries) => {
                for entry in entries.iter_mut() {
                    if entry.id == folder_uid {
                        entry.server_id = new_server_id.to_string();
                    }
                }
            }
        }
    }
}

/// Encode a value into a versioned blob.
pub fn encode_blob<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut blob = Vec::with_capacity(body.len() + 1);
    blob.push(BLOB_FORMAT_VERSION);
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Decode a versioned blob back into a value.
pub fn decode_blob<T: DeserializeOwned>(blob: &[u8]) -> Result<T> {
    let (&version, body) = blob
        .split_first()
        .ok_or_else(|| Error::Serialization("empty blob".to_string()))?;
    if version != BLOB_FORMAT_VERSION {
        return Err(Error::Serialization(format!(
            "unsupported blob format version {}",
            version
        )));
    }
    bincode::deserialize(body).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a `sync_pending` blob; an absent blob is an empty list.
pub fn decode_pending(blob: &[u8]) -> Result<Vec<SyncChange>> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    decode_blob(blob)
}
