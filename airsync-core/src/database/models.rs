//! Raw row models for the sync tables.

/// A row of the `state` table: one generation of one series.
#[derive(Debug, Clone)]
pub struct StateRow {
    pub sync_key: String,
    pub sync_data: Vec<u8>,
    pub device_id: String,
    pub folder_id: String,
    pub user: String,
    pub sync_mod: i64,
    pub sync_pending: Vec<u8>,
    pub sync_timestamp: i64,
}
