//! Seam to the backend content driver.
//!
//! The engine never enumerates content itself. When a server-side folder
//! change is dispatched during a hierarchy sync, the fresh folder stat is
//! fetched through this trait from whatever driver the deployment wires
//! in.

use crate::snapshot::FolderEntry;

/// What the content driver knows about one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderStat {
    pub server_id: String,
    pub parent: String,
    pub display_name: String,
    pub folder_type: u32,
}

/// Read-only view of the backend content driver.
pub trait ContentBackend {
    /// Look up a folder by its backend server id.
    fn get_folder(&self, server_id: &str) -> Option<FolderStat>;

    /// Build the snapshot entry for a folder, pairing the client-facing
    /// uid with the driver's stat.
    fn stat_folder(&self, id: &str, stat: &FolderStat) -> FolderEntry {
        FolderEntry {
            id: id.to_string(),
            server_id: stat.server_id.clone(),
            parent: stat.parent.clone(),
            display_name: stat.display_name.clone(),
            folder_type: stat.folder_type,
        }
    }
}
