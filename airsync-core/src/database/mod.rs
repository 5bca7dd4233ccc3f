//! SQLite storage layer: schema management and row models.

pub mod models;
pub mod schema;

pub use models::StateRow;
pub use schema::{Database, StoreLocation};
