//! Sync-State Engine Core Library
//!
//! This library is the server-side state engine for a mobile
//! synchronization protocol: it tracks, per (device, user, collection),
//! the continuation token presented by the client, the snapshot tied to
//! that token, the record of client-originated changes (so they are not
//! echoed back), device provisioning and remote-wipe lifecycle, and the
//! resumable long-poll cache.
//!
//! Protocol handlers create one [`StateManager`] per request and drive it
//! through `load_state` / `update_state` / `save`. Everything durable
//! lives in the SQLite store; in-memory objects never outlive a request.

pub mod backend;
pub mod cache;
pub mod database;
pub mod device;
pub mod manager;
pub mod map;
pub mod models;
pub mod snapshot;
pub mod state;
pub mod synckey;

pub use backend::{ContentBackend, FolderStat};
pub use cache::{CacheField, CachedFolder, CollectionOptions, SyncCache};
pub use database::Database;
pub use device::{DeviceFilter, DeviceListEntry, DeviceRecord, RemoveStateOptions};
pub use manager::{StateManager, HIERARCHY_FOLDER_ID, STAMP_REFRESH_THRESHOLD};
pub use models::{
    ChangeOrigin, ChangeType, CollectionContext, ContentClass, MessageFlags, RemoteWipeStatus,
    RequestType, SyncChange,
};
pub use snapshot::{
    CollectionBody, CollectionSnapshot, FolderEntry, ItemState, MessageState, SyncData,
};
pub use synckey::SyncKey;

use thiserror::Error;

/// Result type for sync-state operations
pub type Result<T> = std::result::Result<T, Error>;

/// General error type for sync-state operations
#[derive(Error, Debug)]
pub enum Error {
    /// No state row matches the presented sync key. Non-fatal: the caller
    /// answers the client with a key-mismatch status and the client
    /// restarts its series.
    #[error("no state for the presented sync key")]
    StateGone,

    #[error("malformed sync key: {0}")]
    Protocol(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("blob codec error: {0}")]
    Serialization(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
