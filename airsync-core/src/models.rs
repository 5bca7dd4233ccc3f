//! Domain model types shared across the engine.

use crate::snapshot::FolderEntry;
use serde::{Deserialize, Serialize};

/// Which protocol command a state load serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    FolderSync,
    Sync,
    MoveItems,
}

/// Kind of change flowing through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Change,
    Delete,
    Flags,
}

/// Who originated a change: the mobile client or the server exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Client,
    Server,
}

/// Content class of a collection, taken from inbound collection metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    Email,
    Contacts,
    Calendar,
    Tasks,
    Notes,
}

impl ContentClass {
    /// Convert content class to its string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Contacts => "contacts",
            Self::Calendar => "calendar",
            Self::Tasks => "tasks",
            Self::Notes => "notes",
        }
    }

    /// Parse a content class from its string representation.
    pub fn parse(s: &str) -> Self {
        match s {
            "email" => Self::Email,
            "calendar" => Self::Calendar,
            "tasks" => Self::Tasks,
            "notes" => Self::Notes,
            _ => Self::Contacts,
        }
    }
}

/// Remote-wipe lifecycle of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteWipeStatus {
    NotApplicable,
    Ok,
    Pending,
    Wiped,
}

impl Default for RemoteWipeStatus {
    fn default() -> Self {
        Self::NotApplicable
    }
}

impl RemoteWipeStatus {
    /// Convert wipe status to its string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotApplicable => "na",
            Self::Ok => "ok",
            Self::Pending => "pending",
            Self::Wiped => "wiped",
        }
    }

    /// Parse a wipe status from its string representation.
    pub fn parse(s: &str) -> Self {
        match s {
            "ok" => Self::Ok,
            "pending" => Self::Pending,
            "wiped" => Self::Wiped,
            _ => Self::NotApplicable,
        }
    }

    /// Whether a wipe is pending or already executed.
    pub fn wipe_armed(&self) -> bool {
        matches!(self, Self::Pending | Self::Wiped)
    }
}

/// Per-message flag deltas carried by an email change. Only the flags the
/// client actually touched are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub read: Option<bool>,
    pub flagged: Option<bool>,
    pub draft: Option<bool>,
    pub categories: Option<Vec<String>>,
}

impl MessageFlags {
    /// Whether no flag is set at all.
    pub fn is_empty(&self) -> bool {
        self.read.is_none()
            && self.flagged.is_none()
            && self.draft.is_none()
            && self.categories.is_none()
    }
}

/// One change moving through a sync cycle, in either direction.
///
/// For folder-hierarchy changes `folder` carries the full entry; for
/// item changes `server_id` is the message/item uid within the current
/// collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChange {
    pub server_id: String,
    pub change_type: ChangeType,
    /// Modification stamp of the item as published by the content driver.
    pub modtime: i64,
    pub flags: Option<MessageFlags>,
    /// Device-assigned dedup token on Add.
    pub client_id: Option<String>,
    pub folder: Option<FolderEntry>,
}

/// Inbound collection metadata accompanying a SYNC load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionContext {
    pub id: String,
    pub class: ContentClass,
}
